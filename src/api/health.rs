use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status and upstream summary; never exposes the credential.
pub fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "chat-relay is running",
        "upstream": {
            "host": state.upstream.host(),
            "model": state.upstream.model(),
            "credential_configured": state.has_upstream_credential(),
        },
        "log_level": state.config.features.log_level,
    }))
}
