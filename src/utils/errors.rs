//! Client-facing error types for the proxy

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Per-request failures, rendered as an OpenAI-style error envelope
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("{0}")]
    BackendUnavailable(String),

    #[error("Cannot connect to backend server: {0}")]
    BackendUnreachable(String),

    #[error("Backend returned an error: {detail}")]
    BackendError { status: Option<u16>, detail: String },

    #[error("Backend did not respond within {0:?}")]
    RequestTimeout(Duration),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Endpoint {0} not found")]
    NotFound(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::BackendUnavailable(_) | ProxyError::BackendUnreachable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::BackendError { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::RequestTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    /// The `type` field of the error envelope
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::BackendUnavailable(_) => "backend_unavailable",
            ProxyError::BackendUnreachable(_) => "backend_unreachable",
            ProxyError::BackendError { .. } => "backend_error",
            ProxyError::RequestTimeout(_) => "request_timeout",
            ProxyError::InvalidRequest(_) => "invalid_request_error",
            ProxyError::NotFound(_) => "not_found",
        }
    }

    /// Upstream status, when the backend produced one
    pub fn code(&self) -> Option<u16> {
        match self {
            ProxyError::BackendError { status, .. } => *status,
            _ => None,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": self.code(),
            }
        }));

        (self.status_code(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_error_envelope() {
        let response = ProxyError::BackendError {
            status: Some(500),
            detail: "CUDA out of memory".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "backend_error");
        assert_eq!(body["error"]["code"], 500);
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("CUDA out of memory"));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let cases = [
            (
                ProxyError::BackendUnavailable("starting".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ProxyError::BackendUnreachable("refused".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ProxyError::RequestTimeout(Duration::from_secs(1)),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (ProxyError::InvalidRequest("bad".into()), StatusCode::BAD_REQUEST),
        ];

        for (error, status) in cases {
            let response = error.into_response();
            assert_eq!(response.status(), status);
            let body = body_json(response).await;
            assert!(body["error"]["code"].is_null());
        }
    }
}
