//! HTTP request handlers

use axum::{
    extract::FromRef,
    http::Uri,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::lifecycle::BackendLifecycleManager;
use crate::proxy::handler::{chat_completions_handler, completions_handler};
use crate::proxy::ProxyForwarder;
use crate::utils::errors::ProxyError;

mod health;

/// Shared handler state; each handler extracts only the part it needs
#[derive(Clone, FromRef)]
pub struct AppState {
    pub manager: Arc<BackendLifecycleManager>,
    pub forwarder: Arc<ProxyForwarder>,
}

/// Create the main router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/status", get(health::health_handler)) // Alias for /health
        .route("/v1/completions", post(completions_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn not_found(uri: Uri) -> ProxyError {
    ProxyError::NotFound(uri.path().to_string())
}
