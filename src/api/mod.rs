//! # Surface d'ingress HTTP/WebSocket (§6)
//!
//! Routes axum exposant le pipeline : modération synchrone, filtre seul,
//! allowlist de templates, santé, métriques Prometheus et l'abonnement
//! WebSocket au Session Hub (C10). Même squelette `Router::new().route(...)`
//! que `main.rs` du teacher, étendu aux routes du pipeline.

pub mod routes;
pub mod state;
pub mod ws;

pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;

/// Construit le routeur complet de l'application.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/metrics", get(routes::metrics))
        .route("/templates", get(routes::list_templates))
        .route("/moderate", post(routes::moderate))
        .route("/filter", post(routes::filter_only))
        .route("/decide", post(routes::decide))
        .route("/ws", get(ws::websocket_handler))
        .with_state(state)
}
