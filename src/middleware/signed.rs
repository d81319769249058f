use axum::body::{Body, Bytes};
use axum::extract::FromRequest;
use axum::http::{header, HeaderMap, Request};
use std::sync::Arc;

use crate::error::AppError;
use crate::signature::{self, VerifyWindow};
use crate::state::AppState;

pub const TIMESTAMP_HEADER: &str = "X-Hub-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature";

/// Upper bound on a signed body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// A request body whose `X-Hub-Signature` has been verified against the raw
/// bytes and `X-Hub-Timestamp`. Nothing is parsed before verification.
#[derive(Debug, Clone)]
pub struct SignedBody {
    /// Unix seconds from `X-Hub-Timestamp`.
    pub timestamp: u64,
    pub bytes: Bytes,
}

impl SignedBody {
    /// Syntax errors are `INVALID_JSON`; valid JSON of the wrong shape is
    /// `INVALID_REQUEST`.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, AppError> {
        let value: serde_json::Value = serde_json::from_slice(&self.bytes)
            .map_err(|e| AppError::InvalidJson(e.to_string()))?;
        T::deserialize(value).map_err(|e| AppError::BadRequest(e.to_string()))
    }
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn signature_headers(headers: &HeaderMap) -> Result<(u64, String), AppError> {
    let (Some(timestamp), Some(signature)) =
        (headers.get(TIMESTAMP_HEADER), headers.get(SIGNATURE_HEADER))
    else {
        return Err(AppError::MissingHeaders);
    };

    let timestamp = timestamp
        .to_str()
        .ok()
        .and_then(|t| t.trim().parse::<u64>().ok())
        .ok_or(AppError::MalformedTimestamp)?;
    let signature = signature
        .to_str()
        .map_err(|_| AppError::Signature(signature::SignatureError::Invalid))?
        .trim()
        .to_string();
    Ok((timestamp, signature))
}

impl FromRequest<AppState> for SignedBody {
    type Rejection = AppError;

    fn from_request(
        req: Request<Body>,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let secret = Arc::clone(&state.webhook_secret);
        let clock = Arc::clone(&state.clock);
        let max_skew_secs = state.webhook_max_skew_secs;

        async move {
            let (timestamp, header) = signature_headers(req.headers())?;
            if declared_length(req.headers()).is_some_and(|len| len > MAX_BODY_BYTES) {
                return Err(AppError::PayloadTooLarge);
            }
            let bytes = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES)
                .await
                .map_err(|e| {
                    tracing::debug!("signed body rejected: {e}");
                    AppError::PayloadTooLarge
                })?;

            let window = VerifyWindow {
                now_ms: clock.now_ms(),
                max_skew_secs,
            };
            signature::verify(&secret, &header, timestamp, &bytes, window)?;

            Ok(SignedBody { timestamp, bytes })
        }
    }
}
