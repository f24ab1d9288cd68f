pub mod deepseek;
pub mod ollama;
pub mod vllm;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream::BoxStream, StreamExt};
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::{
    config::RelayConfig,
    models::{BackendKind, BackendTarget},
};

use self::{deepseek::DeepSeekClient, ollama::OllamaClient, vllm::VllmClient};

pub type LineStream = BoxStream<'static, Result<Bytes, BackendError>>;

/// Wire framing of a streamed backend body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFormat {
    /// One JSON object per line.
    Ndjson,
    /// Server-sent events, payload after `data: `.
    Sse,
}

pub enum BackendResponse {
    Lines { format: LineFormat, lines: LineStream },
    Full(String),
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn kind(&self) -> BackendKind;
    async fn open(&self, input: &str) -> Result<BackendResponse, BackendError>;
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0}")]
    Connection(String),
    #[error("{0}")]
    Protocol(String),
    #[error("{0}")]
    Credential(String),
    #[error("{0}")]
    Decode(String),
}

impl BackendError {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Connection(_) => "connection",
            BackendError::Protocol(_) => "protocol",
            BackendError::Credential(_) => "credential",
            BackendError::Decode(_) => "decode",
        }
    }

    /// Only a single malformed unit is survivable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BackendError::Decode(_))
    }

    pub(crate) fn unreachable(kind: BackendKind, error: impl std::fmt::Display) -> Self {
        BackendError::Connection(format!("cannot connect to {}: {error}", kind.label()))
    }

    pub(crate) fn http_status(kind: BackendKind, status: StatusCode, detail: Option<String>) -> Self {
        let mut message = format!("{} call failed: HTTP {}", kind.label(), status.as_u16());
        if let Some(detail) = detail {
            message.push_str(" - ");
            message.push_str(&detail);
        }
        BackendError::Protocol(message)
    }
}

/// Builds the client for one session. Adding a backend is a compile error until it is
/// handled here.
pub fn select_backend(
    target: &BackendTarget,
    http: &reqwest::Client,
    config: &RelayConfig,
) -> Box<dyn ChatBackend> {
    match target {
        BackendTarget::LocalGen { model } => {
            Box::new(OllamaClient::new(http.clone(), &config.ollama, model.clone()))
        }
        BackendTarget::InferenceServer { model } => Box::new(VllmClient::new(
            http.clone(),
            &config.vllm,
            model.clone().or_else(|| config.vllm.model.clone()),
        )),
        BackendTarget::Hosted { api_key, model } => Box::new(DeepSeekClient::new(
            http.clone(),
            &config.deepseek,
            api_key
                .clone()
                .or_else(|| config.deepseek.api_key.clone())
                .unwrap_or_default(),
            model
                .clone()
                .unwrap_or_else(|| config.deepseek.model.clone()),
        )),
    }
}

/// Longest line accepted from a streamed body. Anything longer is dropped as malformed.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits a streamed body into trimmed, non-empty lines without buffering the whole body.
pub(crate) fn split_lines(response: reqwest::Response, kind: BackendKind) -> LineStream {
    frame_lines(response.bytes_stream(), kind, MAX_LINE_BYTES)
}

fn frame_lines<S, E>(mut upstream: S, kind: BackendKind, max_line_bytes: usize) -> LineStream
where
    S: futures_util::Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        // Bytes before `scanned` are known to hold no newline.
        let mut scanned = 0;
        // Set while skipping the tail of an oversized line.
        let mut discarding = false;

        while let Some(next) = upstream.next().await {
            let bytes = match next {
                Ok(bytes) => bytes,
                Err(error) => {
                    yield Err(BackendError::Connection(format!(
                        "{} stream interrupted: {error}",
                        kind.label()
                    )));
                    return;
                }
            };

            buffer.extend_from_slice(&bytes);

            while let Some(offset) = buffer[scanned..].iter().position(|byte| *byte == b'\n') {
                let line = buffer.drain(..=scanned + offset).collect::<Vec<u8>>();
                scanned = 0;
                if discarding {
                    discarding = false;
                    continue;
                }
                let trimmed = line.trim_ascii();
                if !trimmed.is_empty() {
                    yield Ok(Bytes::copy_from_slice(trimmed));
                }
            }
            scanned = buffer.len();

            if buffer.len() > max_line_bytes {
                buffer.clear();
                scanned = 0;
                if !discarding {
                    discarding = true;
                    yield Err(BackendError::Decode(format!(
                        "{} line exceeds {max_line_bytes} bytes",
                        kind.label()
                    )));
                }
            }
        }

        let rest = buffer.trim_ascii();
        if !discarding && !rest.is_empty() {
            yield Ok(Bytes::copy_from_slice(rest));
        }
    };

    stream.boxed()
}

/// Reads a failed response body and pulls a human-readable detail out of `field`.
pub(crate) async fn error_detail(response: reqwest::Response, field: &str) -> Option<String> {
    let body = response.json::<Value>().await.ok()?;
    detail_from(&body, field)
}

fn detail_from(body: &Value, field: &str) -> Option<String> {
    match body.get(field)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_owned()),
        Value::String(_) | Value::Null => None,
        Value::Object(object) => object
            .get("message")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .or_else(|| Some(Value::Object(object.clone()).to_string())),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;
    use serde_json::json;

    use super::*;

    async fn framed(chunks: &[&'static str], max_line_bytes: usize) -> Vec<Result<String, String>> {
        let upstream = stream::iter(
            chunks
                .iter()
                .copied()
                .map(|chunk| Ok::<_, std::io::Error>(Bytes::from_static(chunk.as_bytes())))
                .collect::<Vec<_>>(),
        );
        frame_lines(upstream, BackendKind::LocalGen, max_line_bytes)
            .map(|line| match line {
                Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
                Err(error) => Err(error.to_string()),
            })
            .collect()
            .await
    }

    #[tokio::test]
    async fn lines_split_across_chunks_are_reassembled() {
        let lines = framed(&["{\"a\"", ":1}\n\n  {\"b\":2}  \r\n{\"c\"", ":3}"], 64).await;

        assert_eq!(
            lines,
            vec![
                Ok(r#"{"a":1}"#.to_owned()),
                Ok(r#"{"b":2}"#.to_owned()),
                Ok(r#"{"c":3}"#.to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn oversized_line_is_dropped_once_and_framing_resumes() {
        let lines = framed(&["ok\n0123456789", "0123456789", "0123456789\nnext\n"], 16).await;

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], Ok("ok".to_owned()));
        let error = lines[1].as_ref().expect_err("long line should be rejected");
        assert_eq!(error, "Ollama line exceeds 16 bytes");
        assert_eq!(lines[2], Ok("next".to_owned()));
    }

    #[tokio::test]
    async fn oversized_tail_without_newline_is_not_flushed() {
        let lines = framed(&["first\n", "01234567890123456789"], 8).await;

        assert_eq!(
            lines,
            vec![
                Ok("first".to_owned()),
                Err("Ollama line exceeds 8 bytes".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn oversized_lines_are_recoverable_decode_errors() {
        let upstream = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(
            b"xxxxxxxxxxxxxxxxxxxx",
        ))]);
        let first = frame_lines(upstream, BackendKind::InferenceServer, 4)
            .next()
            .await
            .expect("one item");

        let error = first.expect_err("cap should trip");
        assert!(error.is_recoverable());
    }

    #[test]
    fn status_errors_carry_code_and_detail() {
        let error = BackendError::http_status(
            BackendKind::LocalGen,
            StatusCode::NOT_FOUND,
            Some("model 'llama9' not found".to_owned()),
        );

        assert_eq!(
            error.to_string(),
            "Ollama call failed: HTTP 404 - model 'llama9' not found"
        );
        assert_eq!(error.kind(), "protocol");
    }

    #[test]
    fn status_errors_without_detail_stop_at_the_code() {
        let error =
            BackendError::http_status(BackendKind::InferenceServer, StatusCode::BAD_GATEWAY, None);
        assert_eq!(error.to_string(), "vLLM call failed: HTTP 502");
    }

    #[test]
    fn detail_accepts_strings_and_nested_messages() {
        assert_eq!(
            detail_from(&json!({"error": "boom"}), "error").as_deref(),
            Some("boom")
        );
        assert_eq!(
            detail_from(&json!({"error": {"message": "bad model", "code": 400}}), "error")
                .as_deref(),
            Some("bad model")
        );
        assert_eq!(detail_from(&json!({"error": ""}), "error"), None);
        assert_eq!(detail_from(&json!({"other": "x"}), "error"), None);
    }

    #[test]
    fn only_decode_errors_are_recoverable() {
        assert!(BackendError::Decode("bad line".to_owned()).is_recoverable());
        assert!(!BackendError::Connection("down".to_owned()).is_recoverable());
        assert!(!BackendError::Credential("nope".to_owned()).is_recoverable());
    }
}
