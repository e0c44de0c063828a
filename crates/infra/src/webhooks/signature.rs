//! Webhook authenticity checks.
//!
//! Runs before any lookup or mutation. Every comparison is constant-time.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use vayva_shipments::Provider;

use crate::config::WebhookSecrets;

type HmacSha256 = Hmac<Sha256>;

pub const KWIK_SECRET_HEADER: &str = "x-kwik-secret";
pub const COURIER_SIGNATURE_HEADER: &str = "x-courier-signature";

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing {0} header")]
    Missing(&'static str),
    #[error("webhook signature mismatch")]
    Mismatch,
    #[error("no webhook secret configured for {0}")]
    NotConfigured(Provider),
}

impl SignatureError {
    /// HTTP status the endpoint answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            SignatureError::Missing(_) => 401,
            SignatureError::Mismatch | SignatureError::NotConfigured(_) => 403,
        }
    }
}

/// Header carrying the credential for `provider`.
pub fn signature_header(provider: Provider) -> &'static str {
    match provider {
        Provider::Kwik => KWIK_SECRET_HEADER,
        Provider::Courier => COURIER_SIGNATURE_HEADER,
    }
}

/// Verify a webhook delivery.
///
/// `header` is the raw value of [`signature_header`] for the provider, if
/// present. `body` must be the exact bytes received.
pub fn verify(
    provider: Provider,
    secrets: &WebhookSecrets,
    header: Option<&[u8]>,
    body: &[u8],
) -> Result<(), SignatureError> {
    let header = header
        .filter(|h| !h.is_empty())
        .ok_or(SignatureError::Missing(signature_header(provider)))?;
    let secret = secrets
        .for_provider(provider)
        .ok_or(SignatureError::NotConfigured(provider))?;

    match provider {
        Provider::Kwik => verify_shared_secret(secret, header),
        Provider::Courier => verify_hmac(secret, header, body),
    }
}

fn verify_shared_secret(secret: &str, header: &[u8]) -> Result<(), SignatureError> {
    if bool::from(secret.as_bytes().ct_eq(trim_ascii(header))) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

fn verify_hmac(secret: &str, header: &[u8], body: &[u8]) -> Result<(), SignatureError> {
    let header = std::str::from_utf8(header).map_err(|_| SignatureError::Mismatch)?;
    let hex_digest = header
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(SignatureError::Mismatch)?;
    let expected = hex::decode(hex_digest).map_err(|_| SignatureError::Mismatch)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Mismatch)?;
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| SignatureError::Mismatch)
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// `sha256=<hex>` signature a courier would send for `body`.
pub fn sign_courier_body(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length.
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}
