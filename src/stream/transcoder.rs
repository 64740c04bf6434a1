//! Upstream chunk → gateway delta mapping.
//!
//! Stateless: every call maps exactly one upstream `data:` payload.

use serde_json::Value;

use crate::error::GatewayError;
use crate::protocol::{DeltaEvent, MessageFragment, UpstreamChunk};
use crate::util::truncate_utf8;

const MAX_STREAM_ERROR_LEN: usize = 500;

/// Transcode one upstream data payload into a [`DeltaEvent`].
///
/// Absent or null `content` becomes the empty string; `finish_reason` passes
/// through only when present.
///
/// # Errors
///
/// Returns [`GatewayError::Translation`] when the payload is not valid JSON or
/// carries no choice. Callers treat this as a per-frame failure.
///
/// Returns [`GatewayError::Upstream`] with status 500 when the payload is an
/// in-band provider error (a top-level `error` member). This one ends the stream.
pub fn transcode_data_payload(payload: &str) -> Result<DeltaEvent, GatewayError> {
    let chunk: UpstreamChunk = serde_json::from_str(payload)
        .map_err(|e| GatewayError::Translation(format!("invalid upstream chunk JSON: {e}")))?;
    transcode_chunk(chunk)
}

/// Map an already-parsed upstream chunk.
///
/// # Errors
///
/// Returns [`GatewayError::Upstream`] for an in-band error and
/// [`GatewayError::Translation`] when the chunk has no choices.
pub fn transcode_chunk(chunk: UpstreamChunk) -> Result<DeltaEvent, GatewayError> {
    let UpstreamChunk { id, choices, error } = chunk;
    if let Some(error) = error {
        return Err(GatewayError::Upstream {
            status: 500,
            message: stream_error_message(&error),
        });
    }
    let Some(choice) = choices.into_iter().next() else {
        return Err(GatewayError::Translation(
            "upstream chunk has no choices".to_string(),
        ));
    };

    Ok(DeltaEvent {
        id: id.unwrap_or_default(),
        delta: MessageFragment {
            role: choice.delta.role,
            content: choice.delta.content.unwrap_or_default(),
        },
        finish_reason: choice.finish_reason,
    })
}

/// `error.message`, a bare string error, or the raw error JSON, capped at 500 bytes.
fn stream_error_message(error: &Value) -> String {
    let message = match error {
        Value::String(text) => text.trim().to_string(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| other.to_string(), str::to_string),
    };
    if message.is_empty() {
        return "upstream reported an error mid-stream".to_string();
    }
    if message.len() > MAX_STREAM_ERROR_LEN {
        return format!("{}...", truncate_utf8(&message, MAX_STREAM_ERROR_LEN));
    }
    message
}
