use axum::extract::State;
use axum::Json;

use crate::error::AppError;
use crate::gateway::events::parse_event_body;
use crate::middleware::signed::SignedBody;
use crate::state::AppState;

pub async fn receive(
    state: State<AppState>,
    signed: SignedBody,
) -> Result<Json<serde_json::Value>, AppError> {
    let body = parse_event_body(&signed.bytes)?;
    let event = body.into_event(signed.timestamp.saturating_mul(1000));

    tracing::info!(
        event_type = ?event.kind(),
        trace_id = event.trace_id(),
        "webhook event accepted"
    );
    state.bus.publish(event);

    Ok(Json(serde_json::json!({ "ok": true })))
}
