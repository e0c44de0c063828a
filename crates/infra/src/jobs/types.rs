//! Job run and dead-letter records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vayva_core::{CorrelationId, TenantId};

/// Unique identifier of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobRunId(pub Uuid);

impl JobRunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(pub Uuid);

impl DeadLetterId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for DeadLetterId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeadLetterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DeadLetterId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "transient" => Some(ErrorClass::Transient),
            "permanent" => Some(ErrorClass::Permanent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Running,
    Completed,
    Failed,
}

impl JobRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Running => "running",
            JobRunStatus::Completed => "completed",
            JobRunStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(JobRunStatus::Running),
            "completed" => Some(JobRunStatus::Completed),
            "failed" => Some(JobRunStatus::Failed),
            _ => None,
        }
    }
}

/// Audit record of a single attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: JobRunId,
    pub job_name: String,
    pub owner_id: Option<TenantId>,
    pub correlation_id: CorrelationId,
    /// 1-indexed.
    pub attempt_number: u32,
    pub status: JobRunStatus,
    pub error_class: Option<ErrorClass>,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl JobRun {
    pub fn running(
        job_name: impl Into<String>,
        owner_id: Option<TenantId>,
        correlation_id: CorrelationId,
        attempt_number: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobRunId::new(),
            job_name: job_name.into(),
            owner_id,
            correlation_id,
            attempt_number,
            status: JobRunStatus::Running,
            error_class: None,
            last_error: None,
            started_at,
            completed_at: None,
            duration_ms: None,
        }
    }

    pub fn mark_completed(&mut self, finished_at: DateTime<Utc>) {
        self.status = JobRunStatus::Completed;
        self.finish(finished_at);
    }

    pub fn mark_failed(&mut self, class: ErrorClass, error: String, finished_at: DateTime<Utc>) {
        self.status = JobRunStatus::Failed;
        self.error_class = Some(class);
        self.last_error = Some(error);
        self.finish(finished_at);
    }

    fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.completed_at = Some(finished_at);
        self.duration_ms = Some((finished_at - self.started_at).num_milliseconds().max(0) as u64);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    /// Awaiting operator attention.
    Dead,
    /// Handed back to the scheduler by an operator.
    Replayed,
    /// Dropped by an operator.
    Discarded,
}

impl DeadLetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterStatus::Dead => "dead",
            DeadLetterStatus::Replayed => "replayed",
            DeadLetterStatus::Discarded => "discarded",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "dead" => Some(DeadLetterStatus::Dead),
            "replayed" => Some(DeadLetterStatus::Replayed),
            "discarded" => Some(DeadLetterStatus::Discarded),
            _ => None,
        }
    }
}

/// A job chain that exhausted its retries (or failed permanently).
///
/// At most one entry exists per `correlation_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub owner_id: Option<TenantId>,
    pub job_type: String,
    pub correlation_id: CorrelationId,
    pub attempts: u32,
    pub payload_snapshot: serde_json::Value,
    pub last_error: String,
    pub status: DeadLetterStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn run_lifecycle_records_duration() {
        let started = Utc::now();
        let mut run = JobRun::running("sync_kwik", None, CorrelationId::new(), 1, started);
        assert_eq!(run.status, JobRunStatus::Running);

        run.mark_completed(started + Duration::milliseconds(250));
        assert_eq!(run.status, JobRunStatus::Completed);
        assert_eq!(run.duration_ms, Some(250));
        assert!(run.error_class.is_none());
    }

    #[test]
    fn failed_run_keeps_class_and_error() {
        let started = Utc::now();
        let mut run = JobRun::running("sync_kwik", None, CorrelationId::new(), 3, started);
        run.mark_failed(ErrorClass::Transient, "timeout".into(), started);
        assert_eq!(run.status, JobRunStatus::Failed);
        assert_eq!(run.error_class, Some(ErrorClass::Transient));
        assert_eq!(run.last_error.as_deref(), Some("timeout"));
        assert_eq!(run.duration_ms, Some(0));
    }

    #[test]
    fn status_strings_roundtrip() {
        for s in [DeadLetterStatus::Dead, DeadLetterStatus::Replayed, DeadLetterStatus::Discarded] {
            assert_eq!(DeadLetterStatus::parse(s.as_str()), Some(s));
        }
        for s in [JobRunStatus::Running, JobRunStatus::Completed, JobRunStatus::Failed] {
            assert_eq!(JobRunStatus::parse(s.as_str()), Some(s));
        }
        for c in [ErrorClass::Transient, ErrorClass::Permanent] {
            assert_eq!(ErrorClass::parse(c.as_str()), Some(c));
        }
    }
}
