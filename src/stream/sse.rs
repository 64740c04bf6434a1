//! Event-stream line decoder and frame encoders.
//!
//! Upstream bytes arrive in arbitrary chunks; [`FrameDecoder`] carries both
//! incomplete UTF-8 sequences and incomplete lines across chunk boundaries so
//! the frames it yields do not depend on how the body was split.
use super::RawFrame;
use crate::protocol::DeltaEvent;
use crate::util::push_json_string_escaped;
use bytes::Bytes;
use futures_util::Stream;
use memchr::memchr_iter;
use smallvec::SmallVec;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";
const DONE_FRAME: &str = "data: [DONE]\n\n";

struct PendingFrames {
    frames: SmallVec<[RawFrame; 8]>,
    head: usize,
}

impl PendingFrames {
    #[inline]
    fn new() -> Self {
        Self {
            frames: SmallVec::new(),
            head: 0,
        }
    }

    #[inline]
    fn pop_front(&mut self) -> Option<RawFrame> {
        if self.head >= self.frames.len() {
            return None;
        }
        let frame = std::mem::replace(&mut self.frames[self.head], RawFrame::Done);
        self.head += 1;
        if self.head == self.frames.len() {
            self.frames.clear();
            self.head = 0;
        }
        Some(frame)
    }

    #[inline]
    fn extend_from_vec(&mut self, parsed: &mut Vec<RawFrame>) {
        if parsed.is_empty() {
            return;
        }
        self.frames.reserve(parsed.len());
        self.frames.extend(parsed.drain(..));
    }
}

// ---------------------------------------------------------------------------
// FrameDecoder — per-session accumulator
// ---------------------------------------------------------------------------

/// Incremental line decoder for one upstream body.
///
/// Feed it raw byte chunks and it yields [`RawFrame`]s for every complete
/// `data:` line. Blank lines, comments and other event-stream fields are
/// dropped.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
    read_offset: usize,
    utf8_tail: Vec<u8>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return any complete frames.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Feed raw bytes and append complete frames into a caller-provided buffer.
    pub fn feed_into(&mut self, chunk: &[u8], out: &mut Vec<RawFrame>) {
        if self.utf8_tail.is_empty() {
            self.push_utf8(chunk);
        } else {
            let mut joined = std::mem::take(&mut self.utf8_tail);
            joined.extend_from_slice(chunk);
            self.push_utf8(&joined);
        }
        self.drain_lines(out);
    }

    /// Flush state at end of input: a final line without a newline is still a
    /// line, and a dangling partial UTF-8 sequence becomes U+FFFD.
    pub fn finish_into(&mut self, out: &mut Vec<RawFrame>) {
        if !self.utf8_tail.is_empty() {
            self.utf8_tail.clear();
            self.buffer.push(char::REPLACEMENT_CHARACTER);
        }
        if self.read_offset < self.buffer.len() {
            let line = self.buffer[self.read_offset..].trim_end_matches('\r');
            if let Some(frame) = classify_line(line) {
                out.push(frame);
            }
        }
        self.buffer.clear();
        self.read_offset = 0;
    }

    fn push_utf8(&mut self, mut bytes: &[u8]) {
        loop {
            match std::str::from_utf8(bytes) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    return;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    let (valid, rest) = bytes.split_at(valid_up_to);
                    self.buffer
                        .push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match err.error_len() {
                        Some(invalid_len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            bytes = &rest[invalid_len..];
                        }
                        None => {
                            // Incomplete sequence at the end of the chunk.
                            self.utf8_tail.extend_from_slice(rest);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn drain_lines(&mut self, out: &mut Vec<RawFrame>) {
        let mut processed_up_to = self.read_offset;
        let scan_start = processed_up_to;
        let bytes = self.buffer.as_bytes();
        for rel_pos in memchr_iter(b'\n', &bytes[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let mut line = &self.buffer[processed_up_to..line_end];
            if let Some(stripped) = line.strip_suffix('\r') {
                line = stripped;
            }
            if let Some(frame) = classify_line(line) {
                out.push(frame);
            }
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }
}

/// Classify one complete line. Only `data:` lines survive.
fn classify_line(line: &str) -> Option<RawFrame> {
    let value = line.strip_prefix(DATA_PREFIX)?;
    let value = value.strip_prefix(' ').unwrap_or(value);
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed == DONE_SENTINEL {
        return Some(RawFrame::Done);
    }
    Some(RawFrame::Data(value.to_owned()))
}

// ---------------------------------------------------------------------------
// Stream utility
// ---------------------------------------------------------------------------

/// Split an upstream byte stream into [`RawFrame`]s.
///
/// Frames are yielded lazily in arrival order. A read error is yielded once
/// and ends the stream.
pub fn raw_frame_stream<S, E>(byte_stream: S) -> impl Stream<Item = Result<RawFrame, E>>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    use futures_util::StreamExt;

    futures_util::stream::unfold(
        (
            Box::pin(byte_stream),
            FrameDecoder::new(),
            Vec::<RawFrame>::with_capacity(8),
            PendingFrames::new(),
            false,
        ),
        |(mut stream, mut decoder, mut parsed, mut pending, mut exhausted)| async move {
            loop {
                if let Some(frame) = pending.pop_front() {
                    return Some((Ok(frame), (stream, decoder, parsed, pending, exhausted)));
                }
                if exhausted {
                    return None;
                }

                match stream.as_mut().next().await {
                    Some(Ok(bytes)) => decoder.feed_into(&bytes, &mut parsed),
                    Some(Err(err)) => {
                        return Some((Err(err), (stream, decoder, parsed, pending, true)));
                    }
                    None => {
                        decoder.finish_into(&mut parsed);
                        exhausted = true;
                    }
                }
                pending.extend_from_vec(&mut parsed);
            }
        },
    )
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// The completion sentinel frame.
#[must_use]
pub fn done_frame() -> Bytes {
    Bytes::from_static(DONE_FRAME.as_bytes())
}

/// Encode a [`DeltaEvent`] as `data: {"id":..,"delta":{..},"finishReason":..}\n\n`.
#[must_use]
pub fn encode_delta_frame(event: &DeltaEvent) -> Bytes {
    let mut out = String::with_capacity(48 + event.id.len() + event.delta.content.len());
    out.push_str("data: {\"id\":");
    push_json_string_escaped(&mut out, &event.id);
    out.push_str(",\"delta\":{");
    if let Some(role) = event.delta.role.as_deref() {
        out.push_str("\"role\":");
        push_json_string_escaped(&mut out, role);
        out.push(',');
    }
    out.push_str("\"content\":");
    push_json_string_escaped(&mut out, &event.delta.content);
    out.push('}');
    if let Some(reason) = event.finish_reason.as_deref() {
        out.push_str(",\"finishReason\":");
        push_json_string_escaped(&mut out, reason);
    }
    out.push_str("}\n\n");
    Bytes::from(out)
}

/// Encode a terminal error frame: `data: {"error":{"message":...}}\n\n`.
#[must_use]
pub fn encode_error_frame(message: &str) -> Bytes {
    let mut out = String::with_capacity(36 + message.len());
    out.push_str("data: {\"error\":{\"message\":");
    push_json_string_escaped(&mut out, message);
    out.push_str("}}\n\n");
    Bytes::from(out)
}
