//! Inference engine backends
//!
//! Each engine family implements [`Backend`]; the concrete type is picked once
//! from [`BackendKind`] at startup and shared as `Arc<dyn Backend>`.

mod managed;
pub mod sglang;
pub mod vllm;

pub use managed::ProcessBackend;

use async_trait::async_trait;
use axum::body::Bytes;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackendConfig, BackendKind};
use crate::health::{HealthCheckError, HealthSnapshot};
use crate::proxy::request::{ensure_object_field, Endpoint, ProxyRequest};
use crate::supervisor::SupervisorError;

/// Capabilities the lifecycle manager and proxy need from an engine
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short engine name used in logs
    fn name(&self) -> &str;

    /// Base URL of the engine's HTTP server, without trailing slash
    fn base_url(&self) -> &str;

    /// Launch the engine process and return its PID. Does not wait for readiness.
    async fn start(&self) -> Result<u32, SupervisorError>;

    /// Stop the engine process, force-killing it after `grace`. Idempotent.
    async fn stop(&self, grace: Duration) -> Result<(), SupervisorError>;

    /// Single bounded readiness probe
    async fn health_check(&self) -> Result<HealthSnapshot, HealthCheckError>;

    /// `None` while the engine process is alive. Once it is gone, the reason
    /// (exit status and last stderr lines when known).
    async fn exit_reason(&self) -> Option<String>;

    /// Shape an inbound OpenAI payload into the engine's native request body.
    /// Unknown fields are passed through.
    fn translate_request(&self, request: &ProxyRequest) -> Result<serde_json::Value, serde_json::Error> {
        request.payload.to_json()
    }

    /// Adjust a non-streaming response body to the OpenAI response schema
    fn normalize_response(&self, endpoint: Endpoint, body: Bytes) -> Bytes {
        ensure_object_field(endpoint, body)
    }
}

/// Create the backend selected by configuration
pub fn build_backend(config: &BackendConfig) -> anyhow::Result<Arc<dyn Backend>> {
    let launch = match config.kind {
        BackendKind::Sglang => sglang::launch_spec(config),
        BackendKind::Vllm => vllm::launch_spec(config),
    };
    Ok(Arc::new(ProcessBackend::new(config, launch)?))
}
