//! HS256 bearer token verification.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use thiserror::Error;

use crate::{JwtClaims, TokenValidationError, validate_claims};

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("malformed or unsigned token: {0}")]
    Decode(#[from] jsonwebtoken::errors::Error),

    #[error(transparent)]
    Claims(#[from] TokenValidationError),
}

/// Verifies a raw bearer token and yields its claims.
pub trait JwtValidator: Send + Sync {
    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<JwtClaims, JwtError>;
}

pub struct Hs256JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl Hs256JwtValidator {
    pub fn new(secret: Vec<u8>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // The time window lives in our own claim names, checked by `validate_claims`.
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        validation.validate_aud = false;

        Self {
            key: DecodingKey::from_secret(&secret),
            validation,
        }
    }
}

impl JwtValidator for Hs256JwtValidator {
    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<JwtClaims, JwtError> {
        let data = jsonwebtoken::decode::<JwtClaims>(token, &self.key, &self.validation)?;
        validate_claims(&data.claims, now)?;
        Ok(data.claims)
    }
}
