//! Request/response proxy handler

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

use super::request::{Endpoint, ProxyRequest};
use super::streaming::relay_stream;
use super::{build_response, is_hop_by_hop};
use crate::lifecycle::BackendLifecycleManager;
use crate::utils::errors::ProxyError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwards OpenAI requests to the backend while it is serving
pub struct ProxyForwarder {
    manager: Arc<BackendLifecycleManager>,
    client: Client,
    request_timeout: Duration,
}

impl ProxyForwarder {
    pub fn new(
        manager: Arc<BackendLifecycleManager>,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Self::with_connect_timeout(manager, request_timeout, CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(
        manager: Arc<BackendLifecycleManager>,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;

        Ok(ProxyForwarder {
            manager,
            client,
            request_timeout,
        })
    }

    pub async fn handle_completion(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Response, ProxyError> {
        self.forward(Endpoint::Completions, headers, body).await
    }

    pub async fn handle_chat_completion(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Response, ProxyError> {
        self.forward(Endpoint::ChatCompletions, headers, body).await
    }

    async fn forward(
        &self,
        endpoint: Endpoint,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Response, ProxyError> {
        // Fail fast before touching the network
        let status = self.manager.current_state();
        if !status.state.is_serving() {
            return Err(ProxyError::BackendUnavailable(format!(
                "Backend is not ready (state: {})",
                status.state
            )));
        }

        let request = ProxyRequest::parse(endpoint, headers, body, self.request_timeout)?;
        let backend = self.manager.backend();
        let payload = backend
            .translate_request(&request)
            .map_err(|e| ProxyError::InvalidRequest(format!("Cannot translate request: {e}")))?;

        let target_url = format!("{}{}", backend.base_url(), endpoint.path());
        info!(
            model = request.payload.model().unwrap_or("-"),
            stream = request.streaming,
            "Proxying POST {} -> {}",
            endpoint.path(),
            backend.name()
        );

        let mut upstream_request = self.client.post(&target_url).json(&payload);
        for (name, value) in &request.headers {
            // Body was re-serialized, reqwest sets its own content type
            if name.eq_ignore_ascii_case("content-type") {
                continue;
            }
            upstream_request = upstream_request.header(name.as_str(), value.as_str());
        }

        let upstream_response = match timeout(request.remaining(), upstream_request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!("Error proxying to backend (URL: {}): {}", target_url, e);
                // A connect timeout is also a timeout; the backend was never reached
                return Err(if e.is_timeout() && !e.is_connect() {
                    ProxyError::RequestTimeout(request.timeout)
                } else {
                    ProxyError::BackendUnreachable(e.to_string())
                });
            }
            Err(_) => {
                warn!("Backend did not answer {} in time", endpoint.path());
                return Err(ProxyError::RequestTimeout(request.timeout));
            }
        };

        let status = StatusCode::from_u16(upstream_response.status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // Extract headers before consuming the response
        let response_headers: Vec<(String, String)> = upstream_response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        if status.is_server_error() {
            let detail = read_body(upstream_response, &request).await.map_or_else(
                |e| e.to_string(),
                |bytes| String::from_utf8_lossy(&bytes).into_owned(),
            );
            error!(status = status.as_u16(), "Backend error on {}: {}", endpoint.path(), detail);
            return Err(ProxyError::BackendError {
                status: Some(status.as_u16()),
                detail,
            });
        }

        if request.streaming && status.is_success() {
            return Ok(relay_stream(
                Box::pin(upstream_response.bytes_stream()),
                status,
                &response_headers,
                endpoint,
            ));
        }

        let response_body = read_body(upstream_response, &request).await?;
        // Client errors are passed through untouched
        let response_body = if status.is_success() {
            backend.normalize_response(endpoint, response_body)
        } else {
            response_body
        };

        info!("Proxied POST {} -> {} ({})", endpoint.path(), backend.name(), status);
        Ok(build_response(status, &response_headers, Body::from(response_body)))
    }
}

/// Read a complete upstream body within what is left of the request deadline
async fn read_body(response: reqwest::Response, request: &ProxyRequest) -> Result<Bytes, ProxyError> {
    match timeout(request.remaining(), response.bytes()).await {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(e)) => {
            error!("Failed to read response body: {}", e);
            Err(ProxyError::BackendError {
                status: None,
                detail: format!("Failed to read response from backend: {e}"),
            })
        }
        Err(_) => Err(ProxyError::RequestTimeout(request.timeout)),
    }
}

/// `POST /v1/completions`
pub async fn completions_handler(
    State(forwarder): State<Arc<ProxyForwarder>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    forwarder.handle_completion(&headers, &body).await
}

/// `POST /v1/chat/completions`
pub async fn chat_completions_handler(
    State(forwarder): State<Arc<ProxyForwarder>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    forwarder.handle_chat_completion(&headers, &body).await
}
