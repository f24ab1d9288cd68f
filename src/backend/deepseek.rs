use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    backend::{BackendError, BackendResponse, ChatBackend},
    config::{mask_key, DeepSeekConfig},
    models::BackendKind,
};

const KIND: BackendKind = BackendKind::Hosted;

pub const KEY_PREFIX: &str = "sk-";

#[derive(Clone)]
pub struct DeepSeekClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout: std::time::Duration,
}

impl DeepSeekClient {
    pub fn new(
        http: reqwest::Client,
        config: &DeepSeekConfig,
        api_key: String,
        model: String,
    ) -> Self {
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key,
            model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: config.timeout,
        }
    }
}

#[async_trait]
impl ChatBackend for DeepSeekClient {
    fn kind(&self) -> BackendKind {
        KIND
    }

    async fn open(&self, input: &str) -> Result<BackendResponse, BackendError> {
        if !self.api_key.starts_with(KEY_PREFIX) {
            return Err(BackendError::Credential(format!(
                "{} API key format is invalid, it must start with {KEY_PREFIX}",
                KIND.label()
            )));
        }

        let payload = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": input}],
            "stream": false,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens
        });

        debug!(
            backend = %KIND,
            model = %self.model,
            api_key = %mask_key(&self.api_key),
            "calling hosted chat completion"
        );

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|error| BackendError::unreachable(KIND, error))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(BackendError::Credential(format!(
                "{} API key is invalid. Configure a valid key; one can be obtained from https://platform.deepseek.com/",
                KIND.label()
            )));
        }
        if !status.is_success() {
            let detail = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| failure_message(&body));
            return Err(BackendError::http_status(KIND, status, detail));
        }

        let parsed: CompletionResponse = response.json().await.map_err(|error| {
            warn!(backend = %KIND, error = %error, "hosted response is not valid JSON");
            invalid_shape()
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(invalid_shape)?;

        debug!(backend = %KIND, chars = content.chars().count(), "hosted completion received");
        Ok(BackendResponse::Full(content))
    }
}

fn invalid_shape() -> BackendError {
    BackendError::Protocol(format!("{} returned an invalid response shape", KIND.label()))
}

/// Top-level `message`, or the OpenAI-style `error.message`.
fn failure_message(body: &Value) -> Option<String> {
    body.get("message")
        .and_then(Value::as_str)
        .or_else(|| {
            body.get("error")
                .and_then(|error| error.get("message"))
                .and_then(Value::as_str)
        })
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .map(ToOwned::to_owned)
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}
