use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use crate::models::BackendKind;

/// Immutable relay configuration. Built once at startup and shared by `Arc`.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub static_dir: PathBuf,
    pub connect_timeout: Duration,
    /// Pause between characters when a full hosted response is fanned out.
    pub char_delay: Duration,
    pub channel_capacity: usize,
    pub guard_all_streams: bool,
    pub ollama: OllamaConfig,
    pub vllm: VllmConfig,
    pub deepseek: DeepSeekConfig,
}

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct VllmConfig {
    pub host: String,
    pub port: u16,
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct DeepSeekConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5001)),
            static_dir: PathBuf::from("static"),
            connect_timeout: Duration::from_secs(10),
            char_delay: Duration::from_millis(10),
            channel_capacity: 32,
            guard_all_streams: false,
            ollama: OllamaConfig::default(),
            vllm: VllmConfig::default(),
            deepseek: DeepSeekConfig::default(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_owned(),
            temperature: 0.7,
            max_tokens: 1000,
        }
    }
}

impl Default for VllmConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 8000,
            model: None,
            temperature: 0.7,
            max_tokens: 2000,
        }
    }
}

impl Default for DeepSeekConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com/v1".to_owned(),
            api_key: None,
            model: "deepseek-chat".to_owned(),
            temperature: 0.7,
            max_tokens: 2000,
            timeout: Duration::from_secs(120),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen_addr: env::var("RELAY_LISTEN_ADDR")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(defaults.listen_addr),
            static_dir: env::var("RELAY_STATIC_DIR")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.static_dir),
            connect_timeout: Duration::from_secs(read_u64("RELAY_CONNECT_TIMEOUT_SECS", 10)),
            char_delay: Duration::from_millis(read_u64("RELAY_CHAR_DELAY_MS", 10)),
            channel_capacity: read_u64("RELAY_CHANNEL_CAPACITY", 32).max(1) as usize,
            guard_all_streams: read_bool("RELAY_GUARD_ALL_STREAMS", false),
            ollama: OllamaConfig {
                base_url: read_url("OLLAMA_BASE_URL", defaults.ollama.base_url),
                temperature: read_f32("OLLAMA_TEMPERATURE", defaults.ollama.temperature),
                max_tokens: read_u64("OLLAMA_MAX_TOKENS", defaults.ollama.max_tokens as u64)
                    as u32,
            },
            vllm: VllmConfig {
                host: read_string("VLLM_HOST").unwrap_or(defaults.vllm.host),
                port: env::var("VLLM_PORT")
                    .ok()
                    .and_then(|value| value.parse::<u16>().ok())
                    .unwrap_or(defaults.vllm.port),
                model: read_string("VLLM_MODEL"),
                ..defaults.vllm
            },
            deepseek: DeepSeekConfig {
                base_url: read_url("DEEPSEEK_BASE_URL", defaults.deepseek.base_url),
                api_key: read_string("DEEPSEEK_API_KEY"),
                model: read_string("DEEPSEEK_MODEL").unwrap_or(defaults.deepseek.model),
                timeout: Duration::from_secs(read_u64("DEEPSEEK_TIMEOUT_SECS", 120)),
                ..defaults.deepseek
            },
        }
    }

    /// Whether the repetition guard watches the given backend's stream.
    pub fn guards(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::LocalGen => true,
            BackendKind::InferenceServer => self.guard_all_streams,
            BackendKind::Hosted => false,
        }
    }
}

impl VllmConfig {
    pub fn chat_url(&self) -> String {
        format!("http://{}:{}/v1/chat/completions", self.host, self.port)
    }
}

/// Masks a credential for display: first and last four characters survive.
pub fn mask_key(key: &str) -> String {
    let chars = key.chars().collect::<Vec<_>>();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }

    let head = chars[..4].iter().collect::<String>();
    let tail = chars[chars.len() - 4..].iter().collect::<String>();
    format!("{head}{}{tail}", "*".repeat(chars.len() - 8))
}

fn read_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn read_url(name: &str, default: String) -> String {
    read_string(name)
        .unwrap_or(default)
        .trim_end_matches('/')
        .to_owned()
}

fn read_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_f32(name: &str, default: f32) -> f32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<f32>().ok())
        .unwrap_or(default)
}

fn read_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|value| value != "0" && !value.eq_ignore_ascii_case("false"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_middle_of_long_keys() {
        assert_eq!(mask_key("sk-1234567890abcd"), "sk-1*********abcd");
    }

    #[test]
    fn masks_short_keys_entirely() {
        assert_eq!(mask_key("sk-abc"), "******");
        assert_eq!(mask_key(""), "");
    }

    #[test]
    fn guard_scope_defaults_to_local_backend_only() {
        let config = RelayConfig::default();
        assert!(config.guards(BackendKind::LocalGen));
        assert!(!config.guards(BackendKind::InferenceServer));
        assert!(!config.guards(BackendKind::Hosted));

        let widened = RelayConfig {
            guard_all_streams: true,
            ..RelayConfig::default()
        };
        assert!(widened.guards(BackendKind::InferenceServer));
        assert!(!widened.guards(BackendKind::Hosted));
    }

    #[test]
    fn vllm_url_is_built_from_host_and_port() {
        let config = VllmConfig {
            host: "10.0.0.5".to_owned(),
            port: 9000,
            ..VllmConfig::default()
        };
        assert_eq!(config.chat_url(), "http://10.0.0.5:9000/v1/chat/completions");
    }
}
