//! Health probe against the backend's own `/health` surface

use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

/// Point-in-time readiness result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub detail: String,
    pub backend_url: String,
}

impl HealthSnapshot {
    pub fn healthy(backend_url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            healthy: true,
            detail: detail.into(),
            backend_url: backend_url.into(),
        }
    }

    pub fn unhealthy(backend_url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: detail.into(),
            backend_url: backend_url.into(),
        }
    }
}

/// Why a probe did not report the backend as healthy.
///
/// Timeouts and refused connections stay separate: a refused connection while
/// the engine is still loading is expected, once it was serving it means the
/// listener is gone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckError {
    #[error("health check timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("health endpoint returned HTTP {0}")]
    UnexpectedStatus(u16),

    #[error("health request failed: {0}")]
    Request(String),
}

/// Issues bounded-timeout readiness probes
#[derive(Debug, Clone)]
pub struct HealthPoller {
    client: Client,
    health_url: String,
    backend_url: String,
    timeout: Duration,
}

impl HealthPoller {
    pub fn new(backend_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        let backend_url = backend_url.trim_end_matches('/').to_string();

        Ok(HealthPoller {
            client,
            health_url: format!("{}/health", backend_url),
            backend_url,
            timeout,
        })
    }

    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    /// Probe the backend once
    pub async fn check(&self) -> Result<HealthSnapshot, HealthCheckError> {
        let start_time = std::time::Instant::now();

        // Outer timeout also bounds connection setup on a wedged listener
        let response = match timeout(self.timeout, self.client.get(&self.health_url).send()).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(self.classify(e)),
            Err(_) => return Err(HealthCheckError::Timeout(self.timeout)),
        };

        let status = response.status();
        debug!(
            url = %self.health_url,
            status = status.as_u16(),
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "Health probe completed"
        );

        if status.is_success() {
            Ok(HealthSnapshot::healthy(
                &self.backend_url,
                format!("HTTP {}", status.as_u16()),
            ))
        } else {
            Err(HealthCheckError::UnexpectedStatus(status.as_u16()))
        }
    }

    fn classify(&self, e: reqwest::Error) -> HealthCheckError {
        if e.is_timeout() {
            HealthCheckError::Timeout(self.timeout)
        } else if e.is_connect() {
            HealthCheckError::ConnectionRefused(self.backend_url.clone())
        } else {
            HealthCheckError::Request(e.to_string())
        }
    }
}
