pub mod lifecycle;
pub mod sse;
pub mod transcoder;
pub mod writer;

pub use lifecycle::{SessionReport, SessionState, StreamSession};
pub use sse::{raw_frame_stream, FrameDecoder};
pub use transcoder::transcode_data_payload;
pub use writer::{sse_body, SinkClosed, SseWriter};

/// One meaningful line read from the upstream event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    /// Payload of a `data:` line, leading space stripped.
    Data(String),
    /// The `data: [DONE]` completion sentinel.
    Done,
}
