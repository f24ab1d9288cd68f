use std::sync::Arc;

use crate::{config::RelayConfig, metrics::RelayMetrics};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub http: reqwest::Client,
    pub metrics: Arc<RelayMetrics>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Result<Self, reqwest::Error> {
        // No overall timeout: generations stream for as long as the backend keeps talking.
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            config: Arc::new(config),
            http,
            metrics: Arc::new(RelayMetrics::new()),
        })
    }
}
