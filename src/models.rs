use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatBody {
    pub input: String,
    pub config: BackendSelection,
}

/// Backend choice as sent by the bundled client UI.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSelection {
    #[serde(rename = "type")]
    pub backend_type: String,
    #[serde(default)]
    pub ollama_model: Option<String>,
    #[serde(default)]
    pub vllm_model: Option<String>,
    #[serde(default)]
    pub deepseek_key: Option<String>,
    #[serde(default)]
    pub deepseek_model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    LocalGen,
    InferenceServer,
    Hosted,
}

impl BackendKind {
    pub fn wire_name(self) -> &'static str {
        match self {
            BackendKind::LocalGen => "ollama",
            BackendKind::InferenceServer => "vllm",
            BackendKind::Hosted => "deepseek",
        }
    }

    /// Human-facing name used in error messages.
    pub fn label(self) -> &'static str {
        match self {
            BackendKind::LocalGen => "Ollama",
            BackendKind::InferenceServer => "vLLM",
            BackendKind::Hosted => "DeepSeek",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "ollama" => Ok(BackendKind::LocalGen),
            "vllm" => Ok(BackendKind::InferenceServer),
            "deepseek" => Ok(BackendKind::Hosted),
            other => Err(format!(
                "unsupported backend type '{other}', expected one of: ollama, vllm, deepseek"
            )),
        }
    }
}

/// Per-backend parameters. One variant per backend keeps selection exhaustive.
#[derive(Clone)]
pub enum BackendTarget {
    LocalGen { model: String },
    InferenceServer { model: Option<String> },
    Hosted { api_key: Option<String>, model: Option<String> },
}

impl BackendTarget {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendTarget::LocalGen { .. } => BackendKind::LocalGen,
            BackendTarget::InferenceServer { .. } => BackendKind::InferenceServer,
            BackendTarget::Hosted { .. } => BackendKind::Hosted,
        }
    }
}

// Hand-written so credentials never reach the logs.
impl fmt::Debug for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendTarget::LocalGen { model } => {
                f.debug_struct("LocalGen").field("model", model).finish()
            }
            BackendTarget::InferenceServer { model } => {
                f.debug_struct("InferenceServer").field("model", model).finish()
            }
            BackendTarget::Hosted { api_key, model } => f
                .debug_struct("Hosted")
                .field("api_key", &api_key.as_ref().map(|_| "<redacted>"))
                .field("model", model)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub session_id: String,
    pub input: String,
    pub target: BackendTarget,
}

impl ChatBody {
    pub fn into_request(self) -> Result<ChatRequest, String> {
        let kind = self.config.backend_type.parse::<BackendKind>()?;
        let selection = self.config;

        let target = match kind {
            BackendKind::LocalGen => {
                let model = non_empty(selection.ollama_model)
                    .ok_or_else(|| "ollamaModel is required for the ollama backend".to_owned())?;
                BackendTarget::LocalGen { model }
            }
            BackendKind::InferenceServer => BackendTarget::InferenceServer {
                model: non_empty(selection.vllm_model),
            },
            BackendKind::Hosted => BackendTarget::Hosted {
                api_key: non_empty(selection.deepseek_key),
                model: non_empty(selection.deepseek_model),
            },
        };

        Ok(ChatRequest {
            session_id: format!("chat_{}", Uuid::new_v4()),
            input: self.input,
            target,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

/// Canonical outbound unit. Serializes as `{"text": ..}` or `{"error": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayEvent {
    Text(String),
    Error(String),
}

impl RelayEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayEvent::Error(_))
    }
}

#[derive(Debug, Serialize)]
pub struct VllmConfigView {
    pub host: String,
    pub port: u16,
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeepSeekConfigView {
    pub api_key: Option<String>,
    pub model: String,
}

#[derive(Debug, Serialize)]
pub struct SystemMetrics {
    pub memory: Option<String>,
    pub gpu_memory: Option<String>,
}
