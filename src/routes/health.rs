use axum::extract::State;
use axum::Json;

use crate::gateway::GatewayConnection;
use crate::state::AppState;

/// Liveness plus the upstream connection's status. `degraded` once the
/// gateway has given up reconnecting.
pub async fn health(state: State<AppState>) -> Json<serde_json::Value> {
    let gateway = state.gateway.as_ref().map(GatewayConnection::status);
    let degraded = gateway.as_ref().is_some_and(|status| status.retry_exhausted);
    Json(serde_json::json!({
        "status": if degraded { "degraded" } else { "ok" },
        "gateway": gateway,
    }))
}
