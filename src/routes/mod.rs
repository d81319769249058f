mod commands;
mod health;
mod invites;
mod webhook;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/webhook", post(webhook::receive))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        // Invites (issuing requires a signed body)
        .route("/invites", post(invites::create_invite))
        .route("/invites/verify", post(invites::verify_invite))
        // Upstream commands
        .route("/commands", post(commands::enqueue_command))
}
