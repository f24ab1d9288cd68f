pub mod backend;
pub mod config;
pub mod errors;
pub mod guard;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod normalizer;
pub mod session;
pub mod state;
pub mod system;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::info;

pub fn build_state(config: config::RelayConfig) -> Result<state::AppState, std::io::Error> {
    info!(
        ollama = %config.ollama.base_url,
        vllm = %config.vllm.chat_url(),
        deepseek = %config.deepseek.base_url,
        guard_all_streams = config.guard_all_streams,
        "backends configured"
    );
    state::AppState::new(config).map_err(std::io::Error::other)
}

pub fn build_app(state: state::AppState) -> Router {
    // Serves the bundled client UI; `/` resolves to `index.html`.
    let ui = ServeDir::new(&state.config.static_dir);

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/api/chat", post(handlers::chat))
        .route("/api/ollama/models", get(handlers::ollama_models))
        .route("/api/config/vllm", get(handlers::vllm_config))
        .route("/api/config/deepseek", get(handlers::deepseek_config))
        .route("/api/system/metrics", get(handlers::system_metrics))
        .fallback_service(ui)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
