//! Push routine: ship the metric snapshot to a push gateway.

use std::time::Duration;

use prometheus::{Encoder, Registry, TextEncoder};
use reqwest::Client;

use crate::collector::{CollectorError, Routine, Schedule};

/// Job name under which metrics are pushed.
pub const PUSH_JOB: &str = "kasa_exporter";

/// Default push interval (10 seconds).
pub const DEFAULT_PUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Default request timeout (10 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest response body kept in an error.
const MAX_ERROR_BODY: usize = 512;

/// Push gateway target.
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub host: String,
    pub port: u16,
    pub interval: Duration,
    pub timeout: Duration,
}

impl PushConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            interval: DEFAULT_PUSH_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the push interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Grouping URL for [`PUSH_JOB`].
    pub fn url(&self) -> String {
        format!("http://{}:{}/metrics/job/{}", self.host, self.port, PUSH_JOB)
    }
}

/// Push routine.
///
/// Each tick replaces the job's metrics on the gateway with the current
/// snapshot. Failures are left to the next tick.
pub struct PushRoutine {
    config: PushConfig,
    url: String,
    registry: Registry,
    client: Client,
}

impl PushRoutine {
    /// # Errors
    /// Returns `CollectorError::Config` if the HTTP client cannot be built.
    pub fn new(config: PushConfig, registry: Registry) -> Result<Self, CollectorError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CollectorError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url: config.url(),
            config,
            registry,
            client,
        })
    }

    /// Push the current snapshot once.
    pub async fn push(&self) -> Result<(), CollectorError> {
        let encoder = TextEncoder::new();
        let mut body = Vec::new();
        encoder.encode(&self.registry.gather(), &mut body)?;

        let response = self
            .client
            .put(&self.url)
            .header(reqwest::header::CONTENT_TYPE, encoder.format_type())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            truncate_on_char_boundary(&mut body, MAX_ERROR_BODY);
            return Err(CollectorError::PushRejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(url = %self.url, status = status.as_u16(), "Pushed metrics");
        Ok(())
    }
}

/// Shorten `text` to at most `max` bytes without splitting a character.
fn truncate_on_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

impl std::fmt::Debug for PushRoutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushRoutine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Routine for PushRoutine {
    fn name(&self) -> &str {
        "push"
    }

    fn schedule(&self) -> Schedule {
        Schedule::interval(self.config.interval)
    }

    async fn tick(&self) -> Result<(), CollectorError> {
        self.push().await.inspect_err(|e| {
            tracing::warn!(url = %self.url, error = %e, "Failed to push metrics");
        })
    }
}
