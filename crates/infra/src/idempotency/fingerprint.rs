//! Request fingerprints.
//!
//! The payload is serialized with RFC 8785 (JSON Canonicalization Scheme)
//! before hashing, so clients that reorder object keys still match.

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::IdempotencyError;

/// Hex SHA-256 over the canonical JSON encoding of `payload`.
pub fn fingerprint<T: Serialize>(payload: &T) -> Result<String, IdempotencyError> {
    let canonical = serde_json_canonicalizer::to_vec(payload)
        .map_err(|e| IdempotencyError::Fingerprint(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}
