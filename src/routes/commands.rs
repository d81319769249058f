use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::error::AppError;
use crate::gateway::events::{CommandType, GatewayCommand};
use crate::middleware::signed::SignedBody;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandBody {
    #[serde(rename = "type")]
    pub kind: CommandType,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Queue a command for the upstream. Answers as soon as the command is
/// queued; the acknowledgement is only logged.
pub async fn enqueue_command(
    state: State<AppState>,
    signed: SignedBody,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let gateway = state.gateway.as_ref().ok_or(AppError::GatewayUnavailable)?;
    let body: CommandBody = signed.json()?;
    if body.kind == CommandType::Identify {
        return Err(AppError::BadRequest(
            "identify is sent by the relay itself".to_string(),
        ));
    }

    let command = GatewayCommand::new(body.kind, body.data, state.clock.as_ref());
    let trace_id = command.trace_id().to_string();
    let enqueued = gateway.enqueue(command)?;

    let id = enqueued.id.clone();
    tokio::spawn(async move {
        match enqueued.ack.await {
            Ok(Ok(_)) => tracing::debug!(command_id = %enqueued.id, "command acknowledged"),
            Ok(Err(e)) => {
                tracing::warn!(command_id = %enqueued.id, code = e.code(), "command failed: {e}")
            }
            Err(_) => tracing::debug!(command_id = %enqueued.id, "command abandoned"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "id": id, "trace_id": trace_id })),
    ))
}
