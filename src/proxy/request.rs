//! Inbound OpenAI request parsing

use axum::body::Bytes;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::Instant;

use super::is_hop_by_hop;
use crate::utils::errors::ProxyError;

/// Proxied OpenAI endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Completions,
    ChatCompletions,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Completions => "/v1/completions",
            Endpoint::ChatCompletions => "/v1/chat/completions",
        }
    }

    /// Value of the `object` field in a non-streaming response
    pub fn object_name(self) -> &'static str {
        match self {
            Endpoint::Completions => "text_completion",
            Endpoint::ChatCompletions => "chat.completion",
        }
    }
}

/// `POST /v1/completions` body. Fields not modelled here are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub prompt: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `POST /v1/chat/completions` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Completion(CompletionRequest),
    ChatCompletion(ChatCompletionRequest),
}

impl Payload {
    pub fn endpoint(&self) -> Endpoint {
        match self {
            Payload::Completion(_) => Endpoint::Completions,
            Payload::ChatCompletion(_) => Endpoint::ChatCompletions,
        }
    }

    pub fn model(&self) -> Option<&str> {
        match self {
            Payload::Completion(r) => r.model.as_deref(),
            Payload::ChatCompletion(r) => r.model.as_deref(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        let stream = match self {
            Payload::Completion(r) => r.stream,
            Payload::ChatCompletion(r) => r.stream,
        };
        stream.unwrap_or(false)
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            Payload::Completion(r) => serde_json::to_value(r),
            Payload::ChatCompletion(r) => serde_json::to_value(r),
        }
    }
}

/// One client call, alive for a single request/response cycle
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub payload: Payload,
    pub streaming: bool,
    pub deadline: Instant,
    /// Forwarding budget the deadline was derived from
    pub timeout: Duration,
    /// Client headers worth forwarding (hop-by-hop headers removed)
    pub headers: Vec<(String, String)>,
}

impl ProxyRequest {
    pub fn parse(
        endpoint: Endpoint,
        headers: &HeaderMap,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Self, ProxyError> {
        let payload = match endpoint {
            Endpoint::Completions => serde_json::from_slice(body)
                .map(Payload::Completion)
                .map_err(|e| ProxyError::InvalidRequest(format!("Invalid completion request: {e}")))?,
            Endpoint::ChatCompletions => serde_json::from_slice(body)
                .map(Payload::ChatCompletion)
                .map_err(|e| {
                    ProxyError::InvalidRequest(format!("Invalid chat completion request: {e}"))
                })?,
        };

        let headers = headers
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Ok(ProxyRequest {
            streaming: payload.is_streaming(),
            payload,
            deadline: Instant::now() + timeout,
            timeout,
            headers,
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        self.payload.endpoint()
    }

    /// Time left before the request deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Add the OpenAI `object` field to a completion response that lacks it.
/// Bodies that are not JSON completion objects are returned untouched.
pub fn ensure_object_field(endpoint: Endpoint, body: Bytes) -> Bytes {
    let Ok(Value::Object(mut map)) = serde_json::from_slice::<Value>(&body) else {
        return body;
    };
    if map.contains_key("object") || !map.contains_key("choices") {
        return body;
    }

    map.insert(
        "object".to_string(),
        Value::String(endpoint.object_name().to_string()),
    );
    match serde_json::to_vec(&Value::Object(map)) {
        Ok(normalized) => Bytes::from(normalized),
        Err(_) => body,
    }
}
