//! Configuration loading and representation.
//!
//! Values come from environment variables. Loading goes through a lookup
//! closure so tests can supply a map instead of touching the process
//! environment.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use vayva_shipments::Provider;

use crate::jobs::PermanentFailurePolicy;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEV_JWT_SECRET: &str = "dev-secret";

const DAY_SECS: u64 = 24 * 60 * 60;
const MAX_LEASE_SECS: u64 = DAY_SECS;
const MAX_RETENTION_SECS: u64 = 366 * DAY_SECS;
const MAX_BACKOFF_SECS: u64 = 7 * DAY_SECS;
const MAX_JOB_ATTEMPTS: u64 = 1_000;
const MAX_RECONCILE_RETRIES: u64 = 100;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Tunables for the idempotency guard, job wrapper and reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct ReliabilityConfig {
    /// How long a `Started` idempotency record blocks duplicates.
    pub idempotency_lease: Duration,
    /// How long finished idempotency records are kept before purging.
    pub idempotency_retention: Duration,
    pub job_max_attempts: u32,
    /// Delay before attempt N+1 is `backoff_table[N-1]`, clamped to the last entry.
    pub backoff_table: Vec<Duration>,
    /// Uniform jitter fraction applied to each delay (0.3 = ±30%).
    pub backoff_jitter: f64,
    pub permanent_failure_policy: PermanentFailurePolicy,
    /// Compare-and-swap attempts per webhook before giving up.
    pub reconcile_max_retries: u32,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            idempotency_lease: Duration::from_secs(60),
            idempotency_retention: Duration::from_secs(24 * 60 * 60),
            job_max_attempts: 10,
            backoff_table: [60, 120, 300, 600, 1800, 3600, 7200]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
            backoff_jitter: 0.3,
            permanent_failure_policy: PermanentFailurePolicy::CountTowardsBudget,
            reconcile_max_retries: 5,
        }
    }
}

impl ReliabilityConfig {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let idempotency_lease = match lookup("VAYVA_IDEMPOTENCY_LEASE_SECS") {
            Some(raw) => Duration::from_secs(parse_bounded(
                "VAYVA_IDEMPOTENCY_LEASE_SECS",
                &raw,
                MAX_LEASE_SECS,
            )?),
            None => defaults.idempotency_lease,
        };
        let idempotency_retention = match lookup("VAYVA_IDEMPOTENCY_RETENTION_SECS") {
            Some(raw) => Duration::from_secs(parse_bounded(
                "VAYVA_IDEMPOTENCY_RETENTION_SECS",
                &raw,
                MAX_RETENTION_SECS,
            )?),
            None => defaults.idempotency_retention,
        };
        let job_max_attempts = match lookup("VAYVA_JOB_MAX_ATTEMPTS") {
            Some(raw) => parse_bounded("VAYVA_JOB_MAX_ATTEMPTS", &raw, MAX_JOB_ATTEMPTS)? as u32,
            None => defaults.job_max_attempts,
        };
        let backoff_table = match lookup("VAYVA_JOB_BACKOFF_SECS") {
            Some(raw) => parse_backoff_table(&raw)?,
            None => defaults.backoff_table,
        };
        let backoff_jitter = match lookup("VAYVA_JOB_BACKOFF_JITTER") {
            Some(raw) => {
                let jitter: f64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| invalid("VAYVA_JOB_BACKOFF_JITTER", &raw, "not a number"))?;
                if !(0.0..1.0).contains(&jitter) {
                    return Err(invalid("VAYVA_JOB_BACKOFF_JITTER", &raw, "must be in [0, 1)"));
                }
                jitter
            }
            None => defaults.backoff_jitter,
        };
        let permanent_failure_policy = match lookup("VAYVA_JOB_PERMANENT_POLICY") {
            Some(raw) => match raw.trim() {
                "count" => PermanentFailurePolicy::CountTowardsBudget,
                "dead_letter" => PermanentFailurePolicy::DeadLetterImmediately,
                _ => {
                    return Err(invalid(
                        "VAYVA_JOB_PERMANENT_POLICY",
                        &raw,
                        "expected 'count' or 'dead_letter'",
                    ));
                }
            },
            None => defaults.permanent_failure_policy,
        };
        let reconcile_max_retries = match lookup("VAYVA_RECONCILE_MAX_RETRIES") {
            Some(raw) => {
                parse_bounded("VAYVA_RECONCILE_MAX_RETRIES", &raw, MAX_RECONCILE_RETRIES)? as u32
            }
            None => defaults.reconcile_max_retries,
        };

        Ok(Self {
            idempotency_lease,
            idempotency_retention,
            job_max_attempts,
            backoff_table,
            backoff_jitter,
            permanent_failure_policy,
            reconcile_max_retries,
        })
    }
}

/// Per-provider webhook secrets. A provider without a secret rejects every
/// webhook.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct WebhookSecrets {
    pub kwik: Option<String>,
    pub courier: Option<String>,
}

impl WebhookSecrets {
    pub fn for_provider(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::Kwik => self.kwik.as_deref(),
            Provider::Courier => self.courier.as_deref(),
        }
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            kwik: non_empty("KWIK_WEBHOOK_SECRET"),
            courier: non_empty("COURIER_WEBHOOK_SECRET"),
        }
    }
}

impl core::fmt::Debug for WebhookSecrets {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WebhookSecrets")
            .field("kwik", &self.kwik.as_ref().map(|_| "<redacted>"))
            .field("courier", &self.courier.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Everything the API binary needs at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Postgres when set, in-memory otherwise.
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub reliability: ReliabilityConfig,
    pub webhook_secrets: WebhookSecrets,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let jwt_secret = lookup("JWT_SECRET")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                warn!("JWT_SECRET not set; using insecure dev default");
                DEV_JWT_SECRET.to_string()
            });

        Ok(Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            database_url: lookup("DATABASE_URL").filter(|s| !s.trim().is_empty()),
            jwt_secret,
            reliability: ReliabilityConfig::from_lookup(&lookup)?,
            webhook_secrets: WebhookSecrets::from_lookup(&lookup),
        })
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// A positive integer no larger than `max`.
fn parse_bounded(key: &'static str, raw: &str, max: u64) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(invalid(key, raw, "must be greater than zero")),
        Ok(n) if n > max => Err(invalid(key, raw, &format!("must be at most {max}"))),
        Ok(n) => Ok(n),
        Err(_) => Err(invalid(key, raw, "not a positive integer")),
    }
}

fn parse_backoff_table(raw: &str) -> Result<Vec<Duration>, ConfigError> {
    const KEY: &str = "VAYVA_JOB_BACKOFF_SECS";
    let mut table = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        table.push(Duration::from_secs(parse_bounded(KEY, part, MAX_BACKOFF_SECS)?));
    }
    if table.is_empty() {
        return Err(invalid(KEY, raw, "at least one delay is required"));
    }
    if table.windows(2).any(|w| w[1] < w[0]) {
        return Err(invalid(KEY, raw, "delays must be non-decreasing"));
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ReliabilityConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ReliabilityConfig::default());
        assert_eq!(config.idempotency_lease, Duration::from_secs(60));
        assert_eq!(config.job_max_attempts, 10);
        assert_eq!(config.backoff_table.len(), 7);
        assert_eq!(config.backoff_table[6], Duration::from_secs(7200));
        assert_eq!(config.reconcile_max_retries, 5);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = ReliabilityConfig::from_lookup(lookup(&[
            ("VAYVA_IDEMPOTENCY_LEASE_SECS", "30"),
            ("VAYVA_JOB_MAX_ATTEMPTS", "3"),
            ("VAYVA_JOB_BACKOFF_SECS", "1, 2,5"),
            ("VAYVA_JOB_BACKOFF_JITTER", "0"),
            ("VAYVA_JOB_PERMANENT_POLICY", "dead_letter"),
        ]))
        .unwrap();

        assert_eq!(config.idempotency_lease, Duration::from_secs(30));
        assert_eq!(config.job_max_attempts, 3);
        assert_eq!(
            config.backoff_table,
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(5)]
        );
        assert_eq!(config.backoff_jitter, 0.0);
        assert_eq!(
            config.permanent_failure_policy,
            PermanentFailurePolicy::DeadLetterImmediately
        );
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = ReliabilityConfig::from_lookup(lookup(&[("VAYVA_JOB_MAX_ATTEMPTS", "zero")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "VAYVA_JOB_MAX_ATTEMPTS", .. }));

        let err = ReliabilityConfig::from_lookup(lookup(&[("VAYVA_JOB_BACKOFF_SECS", "60,30")]))
            .unwrap_err();
        assert!(err.to_string().contains("non-decreasing"));

        let err = ReliabilityConfig::from_lookup(lookup(&[("VAYVA_JOB_BACKOFF_JITTER", "1.5")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "VAYVA_JOB_BACKOFF_JITTER", .. }));
    }

    #[test]
    fn out_of_range_durations_are_rejected() {
        let err = ReliabilityConfig::from_lookup(lookup(&[(
            "VAYVA_IDEMPOTENCY_LEASE_SECS",
            "18446744073709551615",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "VAYVA_IDEMPOTENCY_LEASE_SECS", .. }));
        assert!(err.to_string().contains("at most 86400"));

        let err = ReliabilityConfig::from_lookup(lookup(&[(
            "VAYVA_IDEMPOTENCY_RETENTION_SECS",
            "9223372036854775807",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "VAYVA_IDEMPOTENCY_RETENTION_SECS", .. }));

        let err = ReliabilityConfig::from_lookup(lookup(&[(
            "VAYVA_JOB_BACKOFF_SECS",
            "60,18446744073709551615",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "VAYVA_JOB_BACKOFF_SECS", .. }));

        let err = ReliabilityConfig::from_lookup(lookup(&[("VAYVA_JOB_MAX_ATTEMPTS", "4294967296")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "VAYVA_JOB_MAX_ATTEMPTS", .. }));

        let err = ReliabilityConfig::from_lookup(lookup(&[("VAYVA_RECONCILE_MAX_RETRIES", "101")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "VAYVA_RECONCILE_MAX_RETRIES", .. }));
    }

    #[test]
    fn upper_bounds_are_inclusive() {
        let config = ReliabilityConfig::from_lookup(lookup(&[
            ("VAYVA_IDEMPOTENCY_LEASE_SECS", "86400"),
            ("VAYVA_IDEMPOTENCY_RETENTION_SECS", "31622400"),
            ("VAYVA_JOB_BACKOFF_SECS", "604800"),
            ("VAYVA_JOB_MAX_ATTEMPTS", "1000"),
            ("VAYVA_RECONCILE_MAX_RETRIES", "100"),
        ]))
        .unwrap();
        assert_eq!(config.idempotency_lease, Duration::from_secs(86_400));
        assert_eq!(config.idempotency_retention, Duration::from_secs(366 * 86_400));
        assert_eq!(config.backoff_table, vec![Duration::from_secs(604_800)]);
        assert_eq!(config.job_max_attempts, 1000);
        assert_eq!(config.reconcile_max_retries, 100);
    }

    #[test]
    fn app_config_falls_back_to_dev_defaults() {
        let config = AppConfig::from_lookup(lookup(&[("KWIK_WEBHOOK_SECRET", "k")])).unwrap();
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(config.jwt_secret, DEV_JWT_SECRET);
        assert!(config.database_url.is_none());
        assert_eq!(config.webhook_secrets.for_provider(Provider::Kwik), Some("k"));
        assert_eq!(config.webhook_secrets.for_provider(Provider::Courier), None);
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let secrets = WebhookSecrets {
            kwik: Some("super-secret".into()),
            courier: None,
        };
        assert!(!format!("{secrets:?}").contains("super-secret"));
    }
}
