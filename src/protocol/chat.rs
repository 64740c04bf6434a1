//! Inbound chat request (gateway schema) and the outbound upstream request body.

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::transport::PreparedUpstream;

/// Conversation role accepted by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role/content message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Caller-facing streaming chat request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default, alias = "max_tokens")]
    pub max_tokens: Option<u32>,
    #[serde(default, alias = "top_p")]
    pub top_p: Option<f64>,
}

impl ChatStreamRequest {
    /// Check message and generation-parameter constraints.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] describing the first violated rule.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.messages.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "messages must contain at least one message".to_string(),
            ));
        }
        if let Some(model) = self.model.as_deref() {
            if model.trim().is_empty() {
                return Err(GatewayError::InvalidRequest(
                    "model cannot be empty when set".to_string(),
                ));
            }
        }
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(GatewayError::InvalidRequest(
                    "temperature must be between 0 and 2".to_string(),
                ));
            }
        }
        if let Some(top_p) = self.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(GatewayError::InvalidRequest(
                    "topP must be between 0 and 1".to_string(),
                ));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(GatewayError::InvalidRequest(
                "maxTokens must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse an inbound body into a validated [`ChatStreamRequest`].
///
/// Accepts either the bare request object or a query envelope
/// `{"query": ..., "variables": {...}}`; in the envelope form the request is
/// read from `variables`, or from `variables.input` when the operation wraps
/// its arguments in a single input object.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidRequest`] for malformed JSON, a request that
/// does not match the schema, or a request that fails validation.
pub fn parse_chat_stream_request(body: &[u8]) -> Result<ChatStreamRequest, GatewayError> {
    let mut value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| GatewayError::InvalidRequest(format!("malformed JSON body: {e}")))?;

    let request_value = match value.get_mut("variables").map(serde_json::Value::take) {
        Some(mut variables) => {
            if !variables.is_object() {
                return Err(GatewayError::InvalidRequest(
                    "variables must be an object".to_string(),
                ));
            }
            let wrapped_in_input = variables.get("messages").is_none()
                && variables
                    .get("input")
                    .is_some_and(serde_json::Value::is_object);
            if wrapped_in_input {
                variables
                    .get_mut("input")
                    .map(serde_json::Value::take)
                    .unwrap_or_default()
            } else {
                variables
            }
        }
        None => value,
    };

    let request: ChatStreamRequest = serde_json::from_value(request_value)
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid chat request: {e}")))?;
    request.validate()?;
    Ok(request)
}

/// Upstream chat-completion request body with streaming enabled.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

impl<'a> UpstreamChatRequest<'a> {
    /// Build the upstream body; caller parameters override configured defaults.
    #[must_use]
    pub fn new(request: &'a ChatStreamRequest, upstream: &'a PreparedUpstream) -> Self {
        Self {
            model: request.model.as_deref().unwrap_or(upstream.model()),
            messages: &request.messages,
            stream: true,
            temperature: request.temperature.or(upstream.defaults().temperature),
            max_tokens: request.max_tokens.or(upstream.defaults().max_tokens),
            top_p: request.top_p.or(upstream.defaults().top_p),
        }
    }

    /// Serialize into the outbound request body.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] if serialization fails.
    pub fn to_body(&self) -> Result<bytes::Bytes, GatewayError> {
        serde_json::to_vec(self)
            .map(bytes::Bytes::from)
            .map_err(|e| GatewayError::Internal(format!("Failed to encode upstream request: {e}")))
    }
}
