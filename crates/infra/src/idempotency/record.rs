use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vayva_core::TenantId;

/// Addresses one idempotency record: a client-supplied key within a scope
/// (e.g. `"shipments.create"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub scope: String,
    pub key: String,
}

impl IdempotencyKey {
    pub fn new(scope: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            key: key.into(),
        }
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.scope, self.key)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Started,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Started => "started",
            IdempotencyStatus::Completed => "completed",
            IdempotencyStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "started" => Some(IdempotencyStatus::Started),
            "completed" => Some(IdempotencyStatus::Completed),
            "failed" => Some(IdempotencyStatus::Failed),
            _ => None,
        }
    }
}

/// The response produced by the first successful execution, replayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status_code: u16,
    pub body: Vec<u8>,
}

impl StoredResponse {
    pub fn new(status_code: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status_code,
            body: body.into(),
        }
    }
}

/// One row per `(scope, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub owner_id: Option<TenantId>,
    /// Hex SHA-256 of the canonical request payload.
    pub request_hash: String,
    pub status: IdempotencyStatus,
    pub stored_response: Option<StoredResponse>,
    pub failure_reason: Option<String>,
    /// Lease deadline while `Started`.
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn started(
        key: IdempotencyKey,
        owner_id: Option<TenantId>,
        request_hash: String,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            owner_id,
            request_hash,
            status: IdempotencyStatus::Started,
            stored_response: None,
            failure_reason: None,
            expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    /// A `Started` record whose holder stopped renewing it.
    pub fn is_abandoned(&self, now: DateTime<Utc>) -> bool {
        self.status == IdempotencyStatus::Started && self.expires_at <= now
    }

    /// Whether a new caller may take the lock over.
    pub fn is_reclaimable(&self, now: DateTime<Utc>) -> bool {
        self.status == IdempotencyStatus::Failed || self.is_abandoned(now)
    }
}
