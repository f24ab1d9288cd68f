//! Turns backend-native lines and payloads into canonical [`RelayEvent`]s.
//!
//! A malformed line is logged and skipped. Any other failure becomes one terminal
//! `RelayEvent::Error` and ends the stream.

use std::time::Duration;

use futures_util::{stream::BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::warn;

use crate::{
    backend::{BackendError, BackendResponse, LineFormat, LineStream},
    models::RelayEvent,
};

pub type EventStream = BoxStream<'static, RelayEvent>;

const SSE_DATA_PREFIX: &str = "data: ";
const SSE_DONE: &str = "[DONE]";

pub fn normalize(response: BackendResponse, pacing: Duration) -> EventStream {
    match response {
        BackendResponse::Lines { format, lines } => normalize_lines(format, lines),
        BackendResponse::Full(content) => fan_out(content, pacing),
    }
}

fn normalize_lines(format: LineFormat, mut lines: LineStream) -> EventStream {
    let parse: fn(&[u8]) -> Result<Option<String>, BackendError> = match format {
        LineFormat::Ndjson => ndjson_fragment,
        LineFormat::Sse => sse_fragment,
    };

    let stream = async_stream::stream! {
        while let Some(next) = lines.next().await {
            let parsed = next.and_then(|line| parse(&line));
            match parsed {
                Ok(Some(fragment)) => yield RelayEvent::Text(fragment),
                Ok(None) => {}
                Err(error) if error.is_recoverable() => {
                    warn!(line_format = ?format, error = %error, "skipping malformed backend line");
                }
                Err(error) => {
                    yield RelayEvent::Error(error.to_string());
                    break;
                }
            }
        }
    };

    stream.boxed()
}

#[derive(Debug, Deserialize)]
struct GenerateLine {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

/// One line of a local generate stream: `{"response": "..", "done": false}`.
pub fn ndjson_fragment(line: &[u8]) -> Result<Option<String>, BackendError> {
    let parsed: GenerateLine = serde_json::from_slice(line)
        .map_err(|error| BackendError::Decode(format!("invalid JSON line: {error}")))?;

    if let Some(error) = parsed.error {
        let message = match error {
            Value::String(message) => message,
            other => other.to_string(),
        };
        return Err(BackendError::Protocol(format!("backend reported an error: {message}")));
    }

    Ok(parsed.response)
}

#[derive(Debug, Deserialize)]
struct SseChunk {
    #[serde(default)]
    choices: Vec<SseChoice>,
}

#[derive(Debug, Deserialize)]
struct SseChoice {
    #[serde(default)]
    delta: SseDelta,
}

#[derive(Debug, Deserialize, Default)]
struct SseDelta {
    #[serde(default)]
    content: Option<String>,
}

/// One line of an OpenAI-compatible event stream.
pub fn sse_fragment(line: &[u8]) -> Result<Option<String>, BackendError> {
    let line = std::str::from_utf8(line)
        .map_err(|error| BackendError::Decode(format!("undecodable stream bytes: {error}")))?;

    let Some(payload) = line.strip_prefix(SSE_DATA_PREFIX) else {
        return Ok(None);
    };
    let payload = payload.trim();
    if payload == SSE_DONE {
        return Ok(None);
    }

    let parsed: SseChunk = serde_json::from_str(payload)
        .map_err(|error| BackendError::Decode(format!("invalid event payload: {error}")))?;

    Ok(parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty()))
}

/// Replays a complete response one character at a time.
pub fn fan_out(content: String, pacing: Duration) -> EventStream {
    let stream = async_stream::stream! {
        let mut chars = content.chars().peekable();
        while let Some(ch) = chars.next() {
            yield RelayEvent::Text(ch.to_string());
            if !pacing.is_zero() && chars.peek().is_some() {
                sleep(pacing).await;
            }
        }
    };

    stream.boxed()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::stream;

    use super::*;

    fn lines(raw: &[&'static str]) -> LineStream {
        stream::iter(
            raw.iter()
                .copied()
                .map(|line| Ok(Bytes::from_static(line.as_bytes())))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    fn texts(events: &[RelayEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|event| match event {
                RelayEvent::Text(text) => Some(text.as_str()),
                RelayEvent::Error(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn ndjson_skips_malformed_lines_and_keeps_order() {
        let response = BackendResponse::Lines {
            format: LineFormat::Ndjson,
            lines: lines(&[
                r#"{"response":"Hel","done":false}"#,
                r#"{"response": broken"#,
                r#"{"response":"lo","done":false}"#,
                "not json at all",
                r#"{"response":"!","done":true}"#,
            ]),
        };

        let events = normalize(response, Duration::ZERO).collect::<Vec<_>>().await;

        assert_eq!(texts(&events), vec!["Hel", "lo", "!"]);
        assert!(events.iter().all(|event| !event.is_terminal()));
    }

    #[tokio::test]
    async fn ndjson_error_line_terminates_stream() {
        let response = BackendResponse::Lines {
            format: LineFormat::Ndjson,
            lines: lines(&[
                r#"{"response":"partial"}"#,
                r#"{"error":"out of memory"}"#,
                r#"{"response":"never"}"#,
            ]),
        };

        let events = normalize(response, Duration::ZERO).collect::<Vec<_>>().await;

        assert_eq!(
            events,
            vec![
                RelayEvent::Text("partial".to_owned()),
                RelayEvent::Error("backend reported an error: out of memory".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn sse_ignores_non_data_lines_and_empty_deltas() {
        let response = BackendResponse::Lines {
            format: LineFormat::Sse,
            lines: lines(&[
                ": keep-alive",
                "event: message",
                r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#,
                r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#,
                "data: {oops",
                r#"data: {"choices":[{"delta":{"content":""}}]}"#,
                r#"data: {"choices":[{"delta":{"content":" there"}}]}"#,
                "data: [DONE]",
            ]),
        };

        let events = normalize(response, Duration::ZERO).collect::<Vec<_>>().await;

        assert_eq!(texts(&events), vec!["Hi", " there"]);
    }

    #[test]
    fn sse_rejects_undecodable_bytes_as_recoverable() {
        let error = sse_fragment(b"data: \xff\xfe").expect_err("invalid utf-8 should fail");
        assert!(error.is_recoverable());
    }

    #[tokio::test]
    async fn transport_failure_becomes_single_error_event() {
        let response = BackendResponse::Lines {
            format: LineFormat::Sse,
            lines: stream::iter(vec![
                Ok(Bytes::from_static(br#"data: {"choices":[{"delta":{"content":"a"}}]}"#)),
                Err(BackendError::Connection("vLLM stream interrupted: reset".to_owned())),
                Ok(Bytes::from_static(br#"data: {"choices":[{"delta":{"content":"b"}}]}"#)),
            ])
            .boxed(),
        };

        let events = normalize(response, Duration::ZERO).collect::<Vec<_>>().await;

        assert_eq!(
            events,
            vec![
                RelayEvent::Text("a".to_owned()),
                RelayEvent::Error("vLLM stream interrupted: reset".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn full_response_fans_out_per_character() {
        let events = normalize(BackendResponse::Full("hi".to_owned()), Duration::ZERO)
            .collect::<Vec<_>>()
            .await;

        assert_eq!(
            events,
            vec![
                RelayEvent::Text("h".to_owned()),
                RelayEvent::Text("i".to_owned())
            ]
        );
    }

    #[tokio::test]
    async fn fan_out_keeps_multibyte_characters_whole() {
        let events = fan_out("好的".to_owned(), Duration::from_millis(1))
            .collect::<Vec<_>>()
            .await;

        assert_eq!(texts(&events), vec!["好", "的"]);
    }
}
