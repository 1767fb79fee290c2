//! Health check endpoint handler

use axum::{extract::State, response::Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::lifecycle::BackendLifecycleManager;

/// Health check endpoint. Always 200; the body carries the backend state.
pub async fn health_handler(State(manager): State<Arc<BackendLifecycleManager>>) -> Json<Value> {
    let status = manager.current_state();
    let backend = manager.backend();

    Json(json!({
        "status": status.state.health_label(),
        "backend": {
            "name": backend.name(),
            "status": status.state,
            "healthy": status.health.as_ref().is_some_and(|h| h.healthy),
            "url": backend.base_url(),
            "detail": status.health.as_ref().map(|h| h.detail.as_str()),
            "pid": status.pid,
            "consecutive_failures": status.consecutive_failures,
            "last_check": status.last_check.map(|t| t.to_rfc3339()),
            "last_error": status.last_error,
            "ready_since": status.ready_since.map(|t| t.to_rfc3339()),
        }
    }))
}
