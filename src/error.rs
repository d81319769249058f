use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::gateway::events::EventParseError;
use crate::gateway::EnqueueError;
use crate::invite::InviteTokenError;
use crate::signature::SignatureError;

#[derive(Debug)]
pub enum AppError {
    MissingHeaders,
    MalformedTimestamp,
    Signature(SignatureError),
    InvalidJson(String),
    InvalidEvent(String),
    Invite(InviteTokenError),
    BadRequest(String),
    Enqueue(EnqueueError),
    PayloadTooLarge,
    GatewayUnavailable,
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::MissingHeaders => "MISSING_HEADERS",
            AppError::MalformedTimestamp => "MALFORMED_TIMESTAMP",
            AppError::Signature(SignatureError::Invalid) => "SIGNATURE_INVALID",
            AppError::Signature(SignatureError::Expired) => "TOKEN_EXPIRED",
            AppError::InvalidJson(_) => "INVALID_JSON",
            AppError::InvalidEvent(_) => "INVALID_EVENT",
            AppError::Invite(e) => e.code(),
            AppError::BadRequest(_) => "INVALID_REQUEST",
            AppError::Enqueue(e) => e.code(),
            AppError::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            AppError::GatewayUnavailable => "GATEWAY_UNAVAILABLE",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MissingHeaders
            | AppError::MalformedTimestamp
            | AppError::InvalidJson(_)
            | AppError::InvalidEvent(_)
            | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Signature(_) => StatusCode::FORBIDDEN,
            AppError::Invite(InviteTokenError::Expired) => StatusCode::GONE,
            AppError::Invite(InviteTokenError::Invalid) => StatusCode::FORBIDDEN,
            AppError::Invite(InviteTokenError::RoomFull) => StatusCode::CONFLICT,
            AppError::Enqueue(_) | AppError::GatewayUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn message(&self) -> String {
        match self {
            AppError::MissingHeaders => "Missing signature headers".to_string(),
            AppError::MalformedTimestamp => "Malformed timestamp".to_string(),
            AppError::Signature(SignatureError::Invalid) => "Invalid signature".to_string(),
            AppError::Signature(SignatureError::Expired) => "Stale timestamp".to_string(),
            AppError::InvalidJson(msg) => msg.clone(),
            AppError::InvalidEvent(msg) => msg.clone(),
            AppError::Invite(e) => e.to_string(),
            AppError::BadRequest(msg) => msg.clone(),
            AppError::Enqueue(e) => e.to_string(),
            AppError::PayloadTooLarge => "Request body too large".to_string(),
            AppError::GatewayUnavailable => "no upstream gateway is configured".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_client_error() {
            tracing::debug!(code = self.code(), "request rejected");
        }
        let body = json!({
            "error": self.message(),
            "code": self.code(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<SignatureError> for AppError {
    fn from(e: SignatureError) -> Self {
        AppError::Signature(e)
    }
}

impl From<EventParseError> for AppError {
    fn from(e: EventParseError) -> Self {
        match e {
            EventParseError::Json(msg) => AppError::InvalidJson(msg),
            EventParseError::Schema(msg) => AppError::InvalidEvent(msg),
        }
    }
}

impl From<InviteTokenError> for AppError {
    fn from(e: InviteTokenError) -> Self {
        AppError::Invite(e)
    }
}

impl From<EnqueueError> for AppError {
    fn from(e: EnqueueError) -> Self {
        AppError::Enqueue(e)
    }
}
