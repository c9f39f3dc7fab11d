pub mod backend;
pub mod client;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod session;
pub mod state;

use axum::{
    routing::{get, post},
    Router,
};
use backend::BackendTarget;
use config::BridgeConfig;
use tracing::info;

pub fn build_state() -> Result<state::AppState, std::io::Error> {
    let config = BridgeConfig::from_env();
    let target = BackendTarget::select(&config.backends);
    info!(
        backend = target.kind().name(),
        url = %target.generate_url(),
        timeout_ms = config.session_timeout.as_millis() as u64,
        "inference backend selected"
    );
    state::AppState::new(config).map_err(std::io::Error::other)
}

pub fn build_app(state: state::AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/api/chat", post(handlers::chat))
        .route("/api/chat/:session_id/stop", post(handlers::stop_session))
        .with_state(state)
}
