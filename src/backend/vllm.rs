use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::{
    backend::{error_detail, split_lines, BackendError, BackendResponse, ChatBackend, LineFormat},
    config::VllmConfig,
    models::BackendKind,
};

const KIND: BackendKind = BackendKind::InferenceServer;

#[derive(Clone)]
pub struct VllmClient {
    http: reqwest::Client,
    url: String,
    model: Option<String>,
    temperature: f32,
    max_tokens: u32,
}

impl VllmClient {
    pub fn new(http: reqwest::Client, config: &VllmConfig, model: Option<String>) -> Self {
        Self {
            http,
            url: config.chat_url(),
            model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl ChatBackend for VllmClient {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn open(&self, input: &str) -> Result<BackendResponse, BackendError> {
        let mut payload = json!({
            "messages": [{"role": "user", "content": input}],
            "stream": true,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens
        });
        // The server picks its single loaded model when none is named.
        if let Some(model) = &self.model {
            payload["model"] = json!(model);
        }

        let response = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|error| BackendError::unreachable(KIND, error))?;

        let status = response.status();
        if !status.is_success() {
            let detail = error_detail(response, "error").await;
            return Err(BackendError::http_status(KIND, status, detail));
        }

        debug!(backend = %KIND, url = %self.url, "chat completion stream opened");
        Ok(BackendResponse::Lines {
            format: LineFormat::Sse,
            lines: split_lines(response, KIND),
        })
    }
}
