use std::convert::Infallible;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::header::{CACHE_CONTROL, CONTENT_TYPE},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use tracing::{info, warn};

use crate::{
    backend::ollama,
    config::mask_key,
    errors::AppError,
    models::{ChatBody, DeepSeekConfigView, RelayEvent, SystemMetrics, VllmConfigView},
    session::RelaySession,
    state::AppState,
    system,
};

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Internal(format!("metrics render failed: {error}")).into_response(),
    }
}

pub async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatBody>, JsonRejection>,
) -> Response {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "chat body rejected");
            return AppError::BadRequest(rejection.body_text()).into_response();
        }
    };

    let request = match body.into_request() {
        Ok(request) => request,
        Err(message) => {
            warn!(error = %message, "chat request rejected");
            return AppError::BadRequest(message).into_response();
        }
    };

    info!(
        session_id = %request.session_id,
        backend = %request.target.kind(),
        target = ?request.target,
        input_chars = request.input.chars().count(),
        "chat request accepted"
    );

    let events = RelaySession::new(
        request,
        state.config.clone(),
        state.http.clone(),
        state.metrics.clone(),
    )
    .start();
    let body = Body::from_stream(events.map(|event| Ok::<String, Infallible>(ndjson_line(&event))));

    (
        [(CONTENT_TYPE, NDJSON_CONTENT_TYPE), (CACHE_CONTROL, "no-cache")],
        body,
    )
        .into_response()
}

pub async fn ollama_models(State(state): State<AppState>) -> Result<Json<Vec<String>>, AppError> {
    let models = ollama::list_models(&state.http, &state.config.ollama)
        .await
        .map_err(|error| {
            warn!(error = %error, "model listing failed");
            AppError::from(error)
        })?;
    Ok(Json(models))
}

pub async fn vllm_config(State(state): State<AppState>) -> Json<VllmConfigView> {
    let vllm = &state.config.vllm;
    Json(VllmConfigView {
        host: vllm.host.clone(),
        port: vllm.port,
        model: vllm.model.clone(),
    })
}

pub async fn deepseek_config(State(state): State<AppState>) -> Json<DeepSeekConfigView> {
    let deepseek = &state.config.deepseek;
    Json(DeepSeekConfigView {
        api_key: deepseek.api_key.as_deref().map(mask_key),
        model: deepseek.model.clone(),
    })
}

pub async fn system_metrics() -> Json<SystemMetrics> {
    Json(system::snapshot())
}

fn ndjson_line(event: &RelayEvent) -> String {
    match serde_json::to_string(event) {
        Ok(mut line) => {
            line.push('\n');
            line
        }
        Err(error) => {
            let fallback = serde_json::json!({
                "error": format!("serialization error: {error}")
            });
            format!("{fallback}\n")
        }
    }
}
