use std::{sync::Arc, time::Instant};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::{
    backend::select_backend,
    config::RelayConfig,
    guard::{GuardVerdict, RepetitionGuard, OUTPUT_ENDED_MARKER},
    metrics::RelayMetrics,
    models::{ChatRequest, RelayEvent},
    normalizer::{normalize, EventStream},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Selecting,
    Streaming,
    Completed,
    Failed,
    /// The caller went away before the stream ended.
    Cancelled,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Selecting => "selecting",
            SessionState::Streaming => "streaming",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }
}

/// Drives one chat request from backend selection to the last outbound event.
pub struct RelaySession {
    request: ChatRequest,
    config: Arc<RelayConfig>,
    http: reqwest::Client,
    metrics: Arc<RelayMetrics>,
    state: SessionState,
}

/// Caller went away; nothing more can be delivered.
struct Disconnected;

impl RelaySession {
    pub fn new(
        request: ChatRequest,
        config: Arc<RelayConfig>,
        http: reqwest::Client,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            request,
            config,
            http,
            metrics,
            state: SessionState::Selecting,
        }
    }

    /// Spawns the session and returns the outbound event stream. Dropping the stream
    /// stops the session and releases its backend connection.
    pub fn start(self) -> ReceiverStream<RelayEvent> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        tokio::spawn(self.run(tx));
        ReceiverStream::new(rx)
    }

    async fn run(mut self, tx: mpsc::Sender<RelayEvent>) {
        let started = Instant::now();
        let _inflight = self.metrics.session_started();
        let session_id = self.request.session_id.clone();

        let backend = select_backend(&self.request.target, &self.http, &self.config);
        let kind = backend.kind();
        self.transition(SessionState::Streaming);

        let opened = tokio::select! {
            opened = backend.open(&self.request.input) => Some(opened),
            _ = tx.closed() => None,
        };

        let state = match opened {
            None => {
                debug!(session_id = %session_id, "caller disconnected before backend answered");
                SessionState::Cancelled
            }
            Some(Ok(response)) => {
                let events = normalize(response, self.config.char_delay);
                let guard = self.config.guards(kind).then(RepetitionGuard::new);
                self.pump(events, guard, &tx).await
            }
            Some(Err(error)) => {
                warn!(
                    session_id = %session_id,
                    backend = %kind,
                    error_kind = error.kind(),
                    error = %error,
                    "backend request failed"
                );
                self.metrics.observe_backend_error(kind.wire_name(), error.kind());
                match tx.send(RelayEvent::Error(error.to_string())).await {
                    Ok(()) => SessionState::Failed,
                    Err(_) => SessionState::Cancelled,
                }
            }
        };

        self.transition(state);
        self.metrics
            .observe_session(kind.wire_name(), state.as_str(), started.elapsed());
        info!(
            session_id = %session_id,
            backend = %kind,
            outcome = state.as_str(),
            elapsed = ?started.elapsed(),
            "chat session finished"
        );
    }

    async fn pump(
        &self,
        mut events: EventStream,
        mut guard: Option<RepetitionGuard>,
        tx: &mpsc::Sender<RelayEvent>,
    ) -> SessionState {
        let kind = self.request.target.kind();
        let mut forwarded = 0usize;

        loop {
            let next = tokio::select! {
                next = events.next() => next,
                _ = tx.closed() => {
                    debug!(
                        session_id = %self.request.session_id,
                        "caller disconnected, dropping backend stream"
                    );
                    return SessionState::Cancelled;
                }
            };
            let Some(event) = next else {
                break;
            };

            let fragment = match event {
                RelayEvent::Text(fragment) => fragment,
                RelayEvent::Error(message) => {
                    warn!(
                        session_id = %self.request.session_id,
                        backend = %kind,
                        error = %message,
                        "backend stream failed"
                    );
                    self.metrics.observe_backend_error(kind.wire_name(), "stream");
                    return match tx.send(RelayEvent::Error(message)).await {
                        Ok(()) => SessionState::Failed,
                        Err(_) => SessionState::Cancelled,
                    };
                }
            };

            let verdict = guard
                .as_mut()
                .map_or(GuardVerdict::Forward, |guard| guard.observe(&fragment));
            match verdict {
                GuardVerdict::Forward => {
                    if fragment.is_empty() {
                        continue;
                    }
                    if self.forward(tx, RelayEvent::Text(fragment)).await.is_err() {
                        return SessionState::Cancelled;
                    }
                    forwarded += 1;
                }
                GuardVerdict::EndWithMarker | GuardVerdict::Stop => {
                    info!(
                        session_id = %self.request.session_id,
                        backend = %kind,
                        verdict = verdict.as_str(),
                        "repetition detected, ending generation"
                    );
                    self.metrics
                        .observe_guard_cut(kind.wire_name(), verdict.as_str());
                    if verdict == GuardVerdict::EndWithMarker {
                        let marker = RelayEvent::Text(OUTPUT_ENDED_MARKER.to_owned());
                        if self.forward(tx, marker).await.is_err() {
                            return SessionState::Cancelled;
                        }
                        forwarded += 1;
                    }
                    break;
                }
            }
        }

        if forwarded == 0 {
            let message = format!("{} returned an empty response", kind.label());
            self.metrics.observe_backend_error(kind.wire_name(), "empty");
            return match tx.send(RelayEvent::Error(message)).await {
                Ok(()) => SessionState::Failed,
                Err(_) => SessionState::Cancelled,
            };
        }

        SessionState::Completed
    }

    async fn forward(
        &self,
        tx: &mpsc::Sender<RelayEvent>,
        event: RelayEvent,
    ) -> Result<(), Disconnected> {
        tx.send(event).await.map_err(|_| {
            debug!(
                session_id = %self.request.session_id,
                "caller disconnected, dropping backend stream"
            );
            Disconnected
        })
    }

    fn transition(&mut self, next: SessionState) {
        debug!(
            session_id = %self.request.session_id,
            from = self.state.as_str(),
            to = next.as_str(),
            "session state change"
        );
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BackendTarget;

    #[tokio::test]
    async fn hosted_session_with_bad_key_yields_one_error() {
        let config = RelayConfig {
            deepseek: crate::config::DeepSeekConfig {
                base_url: "http://127.0.0.1:9".to_owned(),
                ..Default::default()
            },
            ..RelayConfig::default()
        };
        let request = ChatRequest {
            session_id: "chat_test".to_owned(),
            input: "hello".to_owned(),
            target: BackendTarget::Hosted {
                api_key: Some("bad-key".to_owned()),
                model: None,
            },
        };

        let session = RelaySession::new(
            request,
            Arc::new(config),
            reqwest::Client::new(),
            Arc::new(RelayMetrics::new()),
        );
        let events = session.start().collect::<Vec<_>>().await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], RelayEvent::Error(message) if message.contains("sk-")));
    }

    #[tokio::test]
    async fn unreachable_backend_yields_connection_error() {
        let config = RelayConfig {
            ollama: crate::config::OllamaConfig {
                base_url: "http://127.0.0.1:9".to_owned(),
                ..Default::default()
            },
            ..RelayConfig::default()
        };
        let request = ChatRequest {
            session_id: "chat_test".to_owned(),
            input: "hello".to_owned(),
            target: BackendTarget::LocalGen {
                model: "llama3".to_owned(),
            },
        };

        let session = RelaySession::new(
            request,
            Arc::new(config),
            reqwest::Client::new(),
            Arc::new(RelayMetrics::new()),
        );
        let events = session.start().collect::<Vec<_>>().await;

        assert_eq!(events.len(), 1);
        assert!(
            matches!(&events[0], RelayEvent::Error(message) if message.starts_with("cannot connect to Ollama"))
        );
    }
}
