//! Detached HMAC-SHA256 signatures binding a timestamp to a body.
//!
//! The signed message is always `"{timestamp}.{body}"`, never the body alone,
//! so a captured signature cannot be replayed with a fresh timestamp.

use data_encoding::HEXLOWER;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";
pub const DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Malformed header or signature mismatch.
    Invalid,
    /// Timestamp outside the accepted skew window.
    Expired,
}

impl SignatureError {
    pub fn code(&self) -> &'static str {
        match self {
            SignatureError::Invalid => "TOKEN_INVALID",
            SignatureError::Expired => "TOKEN_EXPIRED",
        }
    }
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureError::Invalid => write!(f, "signature is invalid"),
            SignatureError::Expired => write!(f, "signature timestamp is outside the allowed window"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Freshness window for [`verify`].
#[derive(Debug, Clone, Copy)]
pub struct VerifyWindow {
    pub now_ms: u64,
    pub max_skew_secs: u64,
}

fn keyed_mac(secret: &[u8], timestamp: u64, body: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac
}

/// Raw HMAC-SHA256 over `"{timestamp}.{body}"`.
pub fn digest(secret: &[u8], timestamp: u64, body: &[u8]) -> [u8; DIGEST_LEN] {
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&keyed_mac(secret, timestamp, body).finalize().into_bytes());
    out
}

/// Produce a `sha256=<hex>` header value.
pub fn sign(secret: &[u8], timestamp: u64, body: &[u8]) -> String {
    format!(
        "{SIGNATURE_PREFIX}{}",
        HEXLOWER.encode(&digest(secret, timestamp, body))
    )
}

/// Constant-time comparison of `candidate` against the expected digest.
pub fn verify_digest(
    secret: &[u8],
    timestamp: u64,
    body: &[u8],
    candidate: &[u8],
) -> Result<(), SignatureError> {
    if candidate.len() != DIGEST_LEN {
        return Err(SignatureError::Invalid);
    }
    keyed_mac(secret, timestamp, body)
        .verify_slice(candidate)
        .map_err(|_| SignatureError::Invalid)
}

/// Whether `timestamp` (seconds) lies within `max_skew_secs` of `now_ms`, in
/// either direction.
pub fn is_fresh(timestamp: u64, window: VerifyWindow) -> bool {
    let skew_ms = window.now_ms.abs_diff(timestamp.saturating_mul(1000));
    skew_ms <= window.max_skew_secs.saturating_mul(1000)
}

/// Verify a `sha256=<hex>` header against `timestamp` and `body`.
///
/// The signature is checked before freshness.
pub fn verify(
    secret: &[u8],
    header: &str,
    timestamp: u64,
    body: &[u8],
    window: VerifyWindow,
) -> Result<(), SignatureError> {
    let hex = header
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(SignatureError::Invalid)?;
    let candidate = HEXLOWER
        .decode(hex.as_bytes())
        .map_err(|_| SignatureError::Invalid)?;
    verify_digest(secret, timestamp, body, &candidate)?;

    if !is_fresh(timestamp, window) {
        return Err(SignatureError::Expired);
    }
    Ok(())
}
