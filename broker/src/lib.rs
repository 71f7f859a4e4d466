//! # Lattice Relay Broker
//!
//! The central process of the relay fabric. Agents hold one persistent
//! WebSocket each; the broker routes multiplexed tunnel streams between
//! them and keeps per-rule traffic attribution.
//!
//! ```text
//! entry agent ──WS──► broker ──WS──► exit agent ──TCP──► target
//! ```
//!
//! - [`link`]   — per-agent connection lifecycle and send queue
//! - [`router`] — the per-stream route engine
//! - [`state`]  — agent directory, route table, injected integrations
//! - [`api`]    — REST inspection endpoints

pub mod api;
pub mod link;
pub mod router;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

pub use state::AppState;

/// Builds the broker's axum router: the agent WebSocket endpoint plus the
/// inspection API.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(link::ws_handler))
        .route("/api/agents", get(api::list_agents))
        .route("/api/agents/{id}/refresh", post(api::refresh_agent_rules))
        .route("/api/check_port", get(api::check_port))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
