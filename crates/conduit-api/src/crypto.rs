//! HMAC-SHA256 signatures of pushed events.
//!
//! The `X-Signature` header accepts three spellings of the same digest:
//! `sha256=<hex>`, `v1=<hex>` and bare hex.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Why a signature was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// No signature header.
    #[error("signature header missing")]
    Missing,

    /// The header is neither prefixed nor bare hex.
    #[error("invalid signature format: expected 'sha256=<hex>', 'v1=<hex>' or raw hex")]
    InvalidFormat,

    /// The digest does not match the body.
    #[error("signature mismatch")]
    Mismatch,

    /// The configured secret is unusable.
    #[error("invalid secret key")]
    InvalidSecret,
}

impl SignatureError {
    /// Stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Missing => "SIGNATURE_MISSING",
            Self::InvalidFormat => "SIGNATURE_INVALID_FORMAT",
            Self::Mismatch => "SIGNATURE_MISMATCH",
            Self::InvalidSecret => "SIGNATURE_INVALID_SECRET",
        }
    }
}

/// Hex HMAC-SHA256 of `payload` under `secret`.
///
/// # Errors
///
/// Returns [`SignatureError::InvalidSecret`] for an empty secret.
pub fn sign(payload: &[u8], secret: &str) -> Result<String, SignatureError> {
    Ok(hex::encode(mac(payload, secret)?.finalize().into_bytes()))
}

/// Checks `signature` against the HMAC of `payload`.
///
/// The comparison runs in constant time.
///
/// # Example
///
/// ```
/// use conduit_api::crypto::{sign, verify_signature};
///
/// let body = br#"{"eventType":"PATIENT_CREATED"}"#;
/// let header = format!("sha256={}", sign(body, "whsec").unwrap());
///
/// assert!(verify_signature(body, &header, "whsec").is_ok());
/// assert!(verify_signature(body, &header, "other").is_err());
/// ```
///
/// # Errors
///
/// Returns the reason the signature was rejected.
pub fn verify_signature(payload: &[u8], signature: &str, secret: &str) -> Result<(), SignatureError> {
    let signature = signature.trim();
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }

    let digest = parse_signature_format(signature)?;
    mac(payload, secret)?.verify_slice(&digest).map_err(|_| SignatureError::Mismatch)
}

/// Constant-time equality for shared secrets such as API keys.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn mac(payload: &[u8], secret: &str) -> Result<HmacSha256, SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::InvalidSecret);
    }
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(payload);
    Ok(mac)
}

fn parse_signature_format(signature: &str) -> Result<Vec<u8>, SignatureError> {
    let hex_digest = signature
        .strip_prefix("sha256=")
        .or_else(|| signature.strip_prefix("v1="))
        .unwrap_or(signature);

    hex::decode(hex_digest).map_err(|_| SignatureError::InvalidFormat)
}
