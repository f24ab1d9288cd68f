use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{
    backend::{error_detail, split_lines, BackendError, BackendResponse, ChatBackend, LineFormat},
    config::OllamaConfig,
    models::BackendKind,
};

const KIND: BackendKind = BackendKind::LocalGen;

#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OllamaClient {
    pub fn new(http: reqwest::Client, config: &OllamaConfig, model: String) -> Self {
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl ChatBackend for OllamaClient {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn open(&self, input: &str) -> Result<BackendResponse, BackendError> {
        let payload = json!({
            "model": self.model,
            "prompt": input,
            "stream": true,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_tokens
            }
        });

        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|error| BackendError::unreachable(KIND, error))?;

        let status = response.status();
        if !status.is_success() {
            let detail = error_detail(response, "error").await;
            return Err(BackendError::http_status(KIND, status, detail));
        }

        debug!(backend = %KIND, model = %self.model, "generate stream opened");
        Ok(BackendResponse::Lines {
            format: LineFormat::Ndjson,
            lines: split_lines(response, KIND),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Names of the models installed on the local daemon.
pub async fn list_models(
    http: &reqwest::Client,
    config: &OllamaConfig,
) -> Result<Vec<String>, BackendError> {
    let response = http
        .get(format!("{}/api/tags", config.base_url.trim_end_matches('/')))
        .send()
        .await
        .map_err(|error| BackendError::unreachable(KIND, error))?;

    let status = response.status();
    if !status.is_success() {
        let detail = error_detail(response, "error").await;
        return Err(BackendError::http_status(KIND, status, detail));
    }

    let tags: TagsResponse = response.json().await.map_err(|error| {
        BackendError::Protocol(format!("{} returned an invalid model list: {error}", KIND.label()))
    })?;

    Ok(tags
        .models
        .into_iter()
        .filter_map(|entry| entry.model.or(entry.name))
        .collect())
}
