//! Failure classification.
//!
//! Errors report a [`TransportSignal`]; the signal alone decides whether a
//! failure is retried. Message text is never inspected.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

use crate::store::StoreError;

use super::types::ErrorClass;

/// What went wrong at the transport level, as far as the error knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "status")]
pub enum TransportSignal {
    Timeout,
    ConnectionReset,
    ConnectionRefused,
    /// Upstream answered with this HTTP status.
    HttpStatus(u16),
    /// The request itself was rejected as invalid.
    Validation,
    /// Nothing more specific is known.
    Unclassified,
}

impl TransportSignal {
    pub fn class(&self) -> ErrorClass {
        match *self {
            TransportSignal::Timeout
            | TransportSignal::ConnectionReset
            | TransportSignal::ConnectionRefused
            | TransportSignal::Unclassified => ErrorClass::Transient,
            TransportSignal::HttpStatus(408 | 429) => ErrorClass::Transient,
            TransportSignal::HttpStatus(status) if (500..600).contains(&status) => {
                ErrorClass::Transient
            }
            TransportSignal::HttpStatus(status) if (400..500).contains(&status) => {
                ErrorClass::Permanent
            }
            // 1xx/2xx/3xx reported as failures are treated as unexplained.
            TransportSignal::HttpStatus(_) => ErrorClass::Transient,
            TransportSignal::Validation => ErrorClass::Permanent,
        }
    }
}

impl fmt::Display for TransportSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportSignal::Timeout => f.write_str("timeout"),
            TransportSignal::ConnectionReset => f.write_str("connection reset"),
            TransportSignal::ConnectionRefused => f.write_str("connection refused"),
            TransportSignal::HttpStatus(status) => write!(f, "http status {status}"),
            TransportSignal::Validation => f.write_str("validation failed"),
            TransportSignal::Unclassified => f.write_str("unclassified failure"),
        }
    }
}

/// Implemented by job error types so the runner can classify them.
pub trait Classify {
    fn transport_signal(&self) -> TransportSignal;

    fn error_class(&self) -> ErrorClass {
        self.transport_signal().class()
    }
}

impl Classify for io::Error {
    fn transport_signal(&self) -> TransportSignal {
        match self.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportSignal::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => TransportSignal::ConnectionReset,
            io::ErrorKind::ConnectionRefused => TransportSignal::ConnectionRefused,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => TransportSignal::Validation,
            _ => TransportSignal::Unclassified,
        }
    }
}

impl Classify for StoreError {
    fn transport_signal(&self) -> TransportSignal {
        match self {
            StoreError::Storage(_) | StoreError::Concurrency(_) => TransportSignal::Unclassified,
            StoreError::Duplicate(_) | StoreError::NotFound(_) | StoreError::Serialization(_) => {
                TransportSignal::Validation
            }
        }
    }
}

impl Classify for TransportSignal {
    fn transport_signal(&self) -> TransportSignal {
        *self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_statuses_split_by_retryability() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert_eq!(TransportSignal::HttpStatus(status).class(), ErrorClass::Transient, "{status}");
        }
        for status in [400, 401, 403, 404, 409, 422] {
            assert_eq!(TransportSignal::HttpStatus(status).class(), ErrorClass::Permanent, "{status}");
        }
    }

    #[test]
    fn network_failures_are_transient() {
        assert_eq!(TransportSignal::Timeout.class(), ErrorClass::Transient);
        assert_eq!(TransportSignal::ConnectionReset.class(), ErrorClass::Transient);
        assert_eq!(TransportSignal::ConnectionRefused.class(), ErrorClass::Transient);
        assert_eq!(TransportSignal::Unclassified.class(), ErrorClass::Transient);
        assert_eq!(TransportSignal::Validation.class(), ErrorClass::Permanent);
    }

    #[test]
    fn store_outages_retry_but_bad_rows_do_not() {
        assert_eq!(StoreError::Storage("pool timed out".into()).error_class(), ErrorClass::Transient);
        assert_eq!(StoreError::Concurrency("v3".into()).error_class(), ErrorClass::Transient);
        assert_eq!(StoreError::Serialization("bad json".into()).error_class(), ErrorClass::Permanent);
        assert_eq!(StoreError::Duplicate("KW-1".into()).error_class(), ErrorClass::Permanent);
    }

    #[test]
    fn io_errors_classify_by_kind_not_message() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "validation failed");
        assert_eq!(timeout.error_class(), ErrorClass::Transient);

        let invalid = io::Error::new(io::ErrorKind::InvalidData, "connection timed out");
        assert_eq!(invalid.error_class(), ErrorClass::Permanent);

        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(refused.transport_signal(), TransportSignal::ConnectionRefused);
    }
}
