use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Upstream incremental chunk (provider schema)
// ---------------------------------------------------------------------------

/// One `data:` payload of the upstream chat-completion stream.
///
/// `error` is set when the provider reports a failure in-band instead of
/// through the response status.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Vec<UpstreamChoice>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamChoice {
    #[serde(default)]
    pub delta: UpstreamDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamDelta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

// ---------------------------------------------------------------------------
// Gateway delta (outgoing schema)
// ---------------------------------------------------------------------------

/// Incremental message fragment. `content` is never null on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFragment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub content: String,
}

/// One schema-normalized unit of the outgoing stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaEvent {
    pub id: String,
    pub delta: MessageFragment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}
