use std::{sync::Arc, time::Duration};

use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,
    sessions_total: IntCounterVec,
    session_duration_seconds: HistogramVec,
    inflight_sessions: IntGauge,
    backend_errors_total: IntCounterVec,
    guard_cuts_total: IntCounterVec,
}

/// Decrements the in-flight gauge when the session task ends, however it ends.
pub struct InflightSession {
    metrics: Arc<RelayMetrics>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let sessions_total = IntCounterVec::new(
            opts!(
                "relay_sessions_total",
                "Chat sessions relayed, by backend and outcome"
            ),
            &["backend", "outcome"],
        )
        .expect("valid sessions_total metric");

        let session_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "relay_session_duration_seconds",
                "Wall time from backend selection to end of stream",
            ),
            &["backend"],
        )
        .expect("valid session_duration_seconds metric");

        let inflight_sessions = IntGauge::new(
            "relay_inflight_sessions",
            "Chat sessions currently streaming",
        )
        .expect("valid inflight_sessions metric");

        let backend_errors_total = IntCounterVec::new(
            opts!(
                "relay_backend_errors_total",
                "Backend failures surfaced to callers, by kind"
            ),
            &["backend", "kind"],
        )
        .expect("valid backend_errors_total metric");

        let guard_cuts_total = IntCounterVec::new(
            opts!(
                "relay_guard_cuts_total",
                "Generations truncated by the repetition guard"
            ),
            &["backend", "verdict"],
        )
        .expect("valid guard_cuts_total metric");

        registry
            .register(Box::new(sessions_total.clone()))
            .expect("register sessions_total");
        registry
            .register(Box::new(session_duration_seconds.clone()))
            .expect("register session_duration_seconds");
        registry
            .register(Box::new(inflight_sessions.clone()))
            .expect("register inflight_sessions");
        registry
            .register(Box::new(backend_errors_total.clone()))
            .expect("register backend_errors_total");
        registry
            .register(Box::new(guard_cuts_total.clone()))
            .expect("register guard_cuts_total");

        Self {
            registry,
            sessions_total,
            session_duration_seconds,
            inflight_sessions,
            backend_errors_total,
            guard_cuts_total,
        }
    }

    pub fn session_started(self: &Arc<Self>) -> InflightSession {
        self.inflight_sessions.inc();
        InflightSession {
            metrics: self.clone(),
        }
    }

    pub fn observe_session(&self, backend: &str, outcome: &str, duration: Duration) {
        self.sessions_total
            .with_label_values(&[backend, outcome])
            .inc();
        self.session_duration_seconds
            .with_label_values(&[backend])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_backend_error(&self, backend: &str, kind: &str) {
        self.backend_errors_total
            .with_label_values(&[backend, kind])
            .inc();
    }

    pub fn observe_guard_cut(&self, backend: &str, verdict: &str) {
        self.guard_cuts_total
            .with_label_values(&[backend, verdict])
            .inc();
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InflightSession {
    fn drop(&mut self) {
        self.metrics.inflight_sessions.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inflight_gauge_follows_session_lifetime() {
        let metrics = Arc::new(RelayMetrics::new());
        let session = metrics.session_started();
        assert_eq!(metrics.inflight_sessions.get(), 1);
        drop(session);
        assert_eq!(metrics.inflight_sessions.get(), 0);
    }

    #[test]
    fn rendered_output_names_recorded_series() {
        let metrics = RelayMetrics::new();
        metrics.observe_session("ollama", "completed", Duration::from_millis(40));
        metrics.observe_guard_cut("ollama", "stop");

        let body = metrics.render().expect("metrics should render");
        assert!(body.contains("relay_sessions_total"));
        assert!(body.contains("relay_guard_cuts_total"));
    }
}
