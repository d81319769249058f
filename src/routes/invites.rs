use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::error::AppError;
use crate::invite::{InviteRequest, VerifyOptions};
use crate::middleware::signed::SignedBody;
use crate::state::AppState;

/// Issue a room invite. Only a backend holding the webhook secret may call it.
pub async fn create_invite(
    state: State<AppState>,
    signed: SignedBody,
) -> Result<Json<serde_json::Value>, AppError> {
    let request: InviteRequest = signed.json()?;
    let issued = state
        .invites
        .create_token(&request)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    Ok(Json(serde_json::json!({ "data": issued })))
}

#[derive(Debug, Deserialize)]
pub struct VerifyInvite {
    pub token: String,
    #[serde(default)]
    pub current_seat_count: Option<u32>,
}

pub async fn verify_invite(
    state: State<AppState>,
    Json(body): Json<VerifyInvite>,
) -> Result<Json<serde_json::Value>, AppError> {
    let claims = state.invites.verify_token(
        &body.token,
        VerifyOptions {
            now_ms: None,
            current_seat_count: body.current_seat_count,
        },
    )?;
    Ok(Json(serde_json::json!({ "data": claims })))
}
