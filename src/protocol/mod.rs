pub mod chat;
pub mod delta;

pub use chat::{parse_chat_stream_request, ChatMessage, ChatStreamRequest, Role, UpstreamChatRequest};
pub use delta::{DeltaEvent, MessageFragment, UpstreamChoice, UpstreamChunk, UpstreamDelta};
