//! Job execution wrapper.
//!
//! - [`JobRunner::execute`] runs one attempt, records a [`JobRun`] and
//!   classifies failures through [`Classify`]
//! - [`BackoffSchedule`] turns an attempt number into a jittered delay
//! - exhausted chains land in the dead-letter table, where operators replay
//!   or discard them; nothing is retried from there automatically

pub mod backoff;
pub mod classify;
pub mod runner;
pub mod types;

pub use backoff::BackoffSchedule;
pub use classify::{Classify, TransportSignal};
pub use runner::{DeadLetterError, JobContext, JobFailure, JobRunner, JobSpec, PermanentFailurePolicy};
pub use types::{
    DeadLetterEntry, DeadLetterId, DeadLetterStatus, ErrorClass, JobRun, JobRunId, JobRunStatus,
};
