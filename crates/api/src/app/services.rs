use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use vayva_core::{CorrelationId, ShipmentId, TenantId};
use vayva_infra::config::{AppConfig, ReliabilityConfig, WebhookSecrets};
use vayva_infra::idempotency::{
    IdempotencyError, IdempotencyGuard, IdempotencyKey, LockOutcome, StoredResponse,
};
use vayva_infra::jobs::{
    DeadLetterEntry, DeadLetterError, DeadLetterId, DeadLetterStatus, JobFailure, JobRunner, JobSpec,
};
use vayva_infra::store::{IdempotencyStore, InMemoryStore, JobStore, PostgresStore, ShipmentStore, StoreError};
use vayva_infra::webhooks::{ReconcileError, ShipmentReconciler, StatusUpdate, WebhookOutcome};
use vayva_shipments::{CanonicalStatus, Provider, Shipment};

/// Job name of the idempotency retention purge.
pub const IDEMPOTENCY_PURGE_JOB: &str = "idempotency.purge";

/// The reliability components, all sharing one store.
pub struct Components<S> {
    pub idempotency: IdempotencyGuard<S>,
    pub jobs: JobRunner<S>,
    pub shipments: ShipmentReconciler<S>,
}

impl<S> Components<S>
where
    S: IdempotencyStore + JobStore + ShipmentStore + Clone,
{
    pub fn new(store: S, config: &ReliabilityConfig) -> Self {
        Self {
            idempotency: IdempotencyGuard::new(store.clone(), config),
            jobs: JobRunner::new(store.clone(), config),
            shipments: ShipmentReconciler::new(store, config),
        }
    }
}

pub enum Backend {
    InMemory(Components<Arc<InMemoryStore>>),
    Postgres(Components<Arc<PostgresStore>>),
}

/// Run the same expression against whichever backend is configured.
macro_rules! with_backend {
    ($services:expr, $c:ident => $body:expr) => {
        match &$services.backend {
            Backend::InMemory($c) => $body,
            Backend::Postgres($c) => $body,
        }
    };
}

pub struct AppServices {
    backend: Backend,
    webhook_secrets: WebhookSecrets,
}

impl AppServices {
    pub fn in_memory(config: &ReliabilityConfig, webhook_secrets: WebhookSecrets) -> Self {
        Self {
            backend: Backend::InMemory(Components::new(InMemoryStore::arc(), config)),
            webhook_secrets,
        }
    }

    pub fn postgres(
        store: PostgresStore,
        config: &ReliabilityConfig,
        webhook_secrets: WebhookSecrets,
    ) -> Self {
        Self {
            backend: Backend::Postgres(Components::new(Arc::new(store), config)),
            webhook_secrets,
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn webhook_secrets(&self) -> &WebhookSecrets {
        &self.webhook_secrets
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            Backend::InMemory(_) => "in_memory",
            Backend::Postgres(_) => "postgres",
        }
    }

    // ---- idempotency ----

    pub async fn lock_key<P: Serialize + Sync>(
        &self,
        key: &IdempotencyKey,
        owner_id: TenantId,
        payload: &P,
    ) -> Result<LockOutcome, IdempotencyError> {
        with_backend!(self, c => c.idempotency.lock_key(key, Some(owner_id), payload).await)
    }

    pub async fn complete_key(
        &self,
        key: &IdempotencyKey,
        response: StoredResponse,
    ) -> Result<(), IdempotencyError> {
        with_backend!(self, c => c.idempotency.complete(key, response).await)
    }

    pub async fn fail_key(&self, key: &IdempotencyKey, reason: &str) -> Result<(), IdempotencyError> {
        with_backend!(self, c => c.idempotency.fail(key, reason).await)
    }

    /// One recorded attempt of the retention purge.
    pub async fn run_idempotency_purge(
        &self,
        correlation_id: CorrelationId,
        attempt: u32,
    ) -> Result<u64, JobFailure<IdempotencyError>> {
        let spec = JobSpec::new(IDEMPOTENCY_PURGE_JOB, json!({}))
            .with_correlation(correlation_id)
            .with_attempt(attempt);
        with_backend!(self, c => c.jobs.execute(spec, |_| c.idempotency.purge_expired()).await)
    }

    // ---- shipments ----

    pub async fn create_shipment(
        &self,
        owner_id: TenantId,
        order_ref: &str,
        provider: Provider,
        tracking_code: Option<String>,
    ) -> Result<Shipment, ReconcileError> {
        with_backend!(self, c => c.shipments.create(Some(owner_id), order_ref, provider, tracking_code).await)
    }

    pub async fn get_shipment(&self, id: ShipmentId) -> Result<Shipment, ReconcileError> {
        with_backend!(self, c => c.shipments.get(id).await)
    }

    pub async fn apply_webhook(
        &self,
        provider: Provider,
        tracking_code: &str,
        raw_status: &str,
        update: StatusUpdate,
    ) -> Result<WebhookOutcome, ReconcileError> {
        with_backend!(self, c => c.shipments.apply_webhook(provider, tracking_code, raw_status, update).await)
    }

    pub async fn transition_manual(
        &self,
        id: ShipmentId,
        to: CanonicalStatus,
        update: StatusUpdate,
    ) -> Result<Shipment, ReconcileError> {
        with_backend!(self, c => c.shipments.transition_manual(id, to, update).await)
    }

    // ---- dead letters ----

    pub async fn list_dead_letters(
        &self,
        owner_id: Option<TenantId>,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        with_backend!(self, c => c.jobs.list_dead_letters(owner_id, status, limit).await)
    }

    pub async fn replay_dead_letter(
        &self,
        owner_id: Option<TenantId>,
        id: DeadLetterId,
    ) -> Result<DeadLetterEntry, DeadLetterError> {
        with_backend!(self, c => c.jobs.replay_dead_letter(owner_id, id).await)
    }

    pub async fn discard_dead_letter(
        &self,
        owner_id: Option<TenantId>,
        id: DeadLetterId,
    ) -> Result<DeadLetterEntry, DeadLetterError> {
        with_backend!(self, c => c.jobs.discard_dead_letter(owner_id, id).await)
    }
}

/// Postgres when `DATABASE_URL` is set, in-memory otherwise.
pub async fn build_services(config: &AppConfig) -> Result<AppServices, StoreError> {
    match config.database_url.as_deref() {
        Some(url) => {
            let store = PostgresStore::connect(url).await?;
            store.migrate().await?;
            info!("using postgres stores");
            Ok(AppServices::postgres(
                store,
                &config.reliability,
                config.webhook_secrets.clone(),
            ))
        }
        None => {
            info!("DATABASE_URL not set; using in-memory stores");
            Ok(AppServices::in_memory(
                &config.reliability,
                config.webhook_secrets.clone(),
            ))
        }
    }
}

/// Drive one purge chain until it succeeds or is dead-lettered, sleeping
/// out each retry delay the runner hands back.
pub async fn run_purge_chain(services: &AppServices, correlation_id: CorrelationId) -> Option<u64> {
    let mut attempt = 1;
    loop {
        match services.run_idempotency_purge(correlation_id, attempt).await {
            Ok(purged) => return Some(purged),
            Err(failure) => match failure.retry_after {
                Some(delay) => {
                    warn!(%correlation_id, attempt, error = %failure, "idempotency purge will retry");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    warn!(
                        %correlation_id,
                        attempt,
                        dead_lettered = failure.dead_lettered,
                        error = %failure,
                        "idempotency purge gave up"
                    );
                    return None;
                }
            },
        }
    }
}

/// Periodically drop finished idempotency records past their retention.
///
/// Each tick starts a new job chain; ticks that fall due while a chain is
/// still retrying are skipped.
pub fn spawn_idempotency_purge(
    services: Arc<AppServices>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            run_purge_chain(&services, CorrelationId::new()).await;
        }
    })
}
