use std::convert::Infallible;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use super::sse::{done_frame, encode_delta_frame, encode_error_frame};
use crate::protocol::DeltaEvent;

/// A single in-flight frame; each write waits for the previous one to be taken.
const SINK_CAPACITY: usize = 1;

/// The outgoing sink is gone: already closed, or the caller disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("outgoing stream closed")]
pub struct SinkClosed;

/// Writes event-stream frames to the caller-facing response body.
///
/// The body side is a bounded channel; awaiting a write is what throttles the
/// upstream read. Closing drops the sender, which ends the response body.
#[derive(Debug)]
pub struct SseWriter {
    tx: Option<mpsc::Sender<Bytes>>,
    frames_written: u64,
}

impl SseWriter {
    /// Create a writer and the receiver that feeds the response body.
    #[must_use]
    pub fn channel() -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        (
            Self {
                tx: Some(tx),
                frames_written: 0,
            },
            rx,
        )
    }

    #[must_use]
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map_or(true, mpsc::Sender::is_closed)
    }

    /// Write one delta frame.
    ///
    /// # Errors
    ///
    /// Returns [`SinkClosed`] when the sink was closed or the caller went away.
    pub async fn write_delta(&mut self, event: &DeltaEvent) -> Result<(), SinkClosed> {
        self.send(encode_delta_frame(event)).await
    }

    /// Write the completion sentinel, then close.
    ///
    /// # Errors
    ///
    /// Returns [`SinkClosed`] when the sink was closed or the caller went away.
    pub async fn write_done(&mut self) -> Result<(), SinkClosed> {
        let result = self.send(done_frame()).await;
        self.close();
        result
    }

    /// Write a terminal error frame, then close.
    ///
    /// # Errors
    ///
    /// Returns [`SinkClosed`] when the sink was closed or the caller went away.
    pub async fn write_error(&mut self, message: &str) -> Result<(), SinkClosed> {
        let result = self.send(encode_error_frame(message)).await;
        self.close();
        result
    }

    /// Close the sink. Returns `true` only for the call that actually closed it.
    pub fn close(&mut self) -> bool {
        self.tx.take().is_some()
    }

    /// Resolves once the caller side is gone (or the sink is already closed).
    pub async fn closed(&self) {
        if let Some(tx) = self.tx.as_ref() {
            tx.closed().await;
        }
    }

    async fn send(&mut self, frame: Bytes) -> Result<(), SinkClosed> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(SinkClosed);
        };
        tx.send(frame).await.map_err(|_| SinkClosed)?;
        self.frames_written += 1;
        Ok(())
    }
}

impl Drop for SseWriter {
    fn drop(&mut self) {
        if self.close() {
            tracing::debug!(
                frames_written = self.frames_written,
                "outgoing stream released without terminal frame"
            );
        }
    }
}

/// Adapt the writer's receiver into a streaming response body.
#[must_use]
pub fn sse_body(rx: mpsc::Receiver<Bytes>) -> axum::body::Body {
    let frames = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (frame, rx))
    });
    axum::body::Body::from_stream(frames.map(Ok::<Bytes, Infallible>))
}
