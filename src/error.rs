/// Error type shared by the request path and the streaming pipeline.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Frame translation error: {0}")]
    Translation(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for status code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    Permission,
    RateLimit,
    ServerError,
    Unknown,
}

/// Map an upstream HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        400 => ErrorCategory::InvalidRequest,
        401 => ErrorCategory::Authentication,
        403 => ErrorCategory::Permission,
        429 => ErrorCategory::RateLimit,
        500..=599 => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    }
}

impl GatewayError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            GatewayError::Config(_)
            | GatewayError::Transport(_)
            | GatewayError::Translation(_)
            | GatewayError::Internal(_) => ErrorCategory::ServerError,
            GatewayError::Upstream { status, .. } => category_from_upstream_status(*status),
        }
    }

    /// Message carried in the caller-facing `{"error":{"message":...}}` object.
    ///
    /// Upstream failures forward the provider's own message unchanged; every
    /// other variant uses its display form.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Upstream { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest => http::StatusCode::BAD_REQUEST,
        ErrorCategory::Authentication => http::StatusCode::UNAUTHORIZED,
        ErrorCategory::Permission => http::StatusCode::FORBIDDEN,
        ErrorCategory::RateLimit => http::StatusCode::TOO_MANY_REQUESTS,
        ErrorCategory::ServerError | ErrorCategory::Unknown => {
            http::StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Gateway error object, identical in buffered responses and stream frames.
#[must_use]
pub fn error_payload(message: &str) -> serde_json::Value {
    serde_json::json!({ "error": { "message": message } })
}

/// Format an error for a buffered (pre-stream) response, returning (`status_code`, JSON body).
#[must_use]
pub fn format_error(err: &GatewayError) -> (http::StatusCode, serde_json::Value) {
    let status = http_status_for_category(err.category());
    (status, error_payload(&err.client_message()))
}

impl axum::response::IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = format_error(&self);
        (status, axum::Json(body)).into_response()
    }
}
