use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use super::sse::raw_frame_stream;
use super::transcoder::transcode_data_payload;
use super::writer::SseWriter;
use super::RawFrame;
use crate::error::GatewayError;
use crate::observability::log_session_complete;

/// How long a terminal frame may wait on a stalled caller before the sink is
/// closed without it.
const TERMINAL_WRITE_GRACE: Duration = Duration::from_secs(5);

/// Session lifecycle. `Completed` and `Errored` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    Completed,
    Errored,
}

impl SessionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Errored)
    }

    fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Idle, SessionState::Streaming | SessionState::Errored)
                | (
                    SessionState::Streaming,
                    SessionState::Streaming | SessionState::Completed | SessionState::Errored
                )
        )
    }
}

/// Final accounting for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub state: SessionState,
    /// Delta frames delivered, excluding the terminal frame.
    pub deltas_emitted: u64,
    /// Upstream data frames dropped because they could not be transcoded.
    pub frames_skipped: u64,
    /// The caller went away before a terminal frame could be delivered.
    pub cancelled: bool,
}

enum Terminal {
    Completed,
    Failed(GatewayError),
    Cancelled,
}

enum Step<T> {
    Ready(T),
    CallerGone,
}

/// One in-flight request through the streaming pipeline.
///
/// Owns the outgoing sink; the upstream body is owned by [`StreamSession::run`]
/// and dropped (releasing its connection) as soon as the session reaches a
/// terminal state.
pub struct StreamSession {
    id: uuid::Uuid,
    state: SessionState,
    writer: SseWriter,
    max_duration: Duration,
    next_frame_seq: u64,
    deltas_emitted: u64,
    frames_skipped: u64,
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("deltas_emitted", &self.deltas_emitted)
            .finish_non_exhaustive()
    }
}

impl StreamSession {
    #[must_use]
    pub fn new(id: uuid::Uuid, writer: SseWriter, max_duration: Duration) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            writer,
            max_duration,
            next_frame_seq: 0,
            deltas_emitted: 0,
            frames_skipped: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to a terminal state.
    ///
    /// `connect` opens the upstream stream; its error becomes the session's
    /// single error frame. The whole run, connect included, is bounded by the
    /// session's maximum duration.
    pub async fn run<C, S, E>(mut self, connect: C) -> SessionReport
    where
        C: Future<Output = Result<S, GatewayError>>,
        S: Stream<Item = Result<Bytes, E>>,
        E: fmt::Display,
    {
        let started = Instant::now();
        let max_duration = self.max_duration;
        let terminal = match tokio::time::timeout(max_duration, self.drive(connect)).await {
            Ok(terminal) => terminal,
            Err(_) => Terminal::Failed(GatewayError::Transport(format!(
                "stream exceeded maximum duration of {}s",
                max_duration.as_secs()
            ))),
        };
        self.finish(terminal, started).await
    }

    async fn drive<C, S, E>(&mut self, connect: C) -> Terminal
    where
        C: Future<Output = Result<S, GatewayError>>,
        S: Stream<Item = Result<Bytes, E>>,
        E: fmt::Display,
    {
        let connected = match self.until_caller_gone(connect).await {
            Step::Ready(connected) => connected,
            Step::CallerGone => return Terminal::Cancelled,
        };
        let body = match connected {
            Ok(body) => body,
            Err(err) => return Terminal::Failed(err),
        };
        self.transition(SessionState::Streaming);

        let mut frames = Box::pin(raw_frame_stream(body));
        loop {
            let next = match self.until_caller_gone(frames.next()).await {
                Step::Ready(next) => next,
                Step::CallerGone => return Terminal::Cancelled,
            };
            match next {
                Some(Ok(RawFrame::Data(payload))) => {
                    if let Some(terminal) = self.emit_payload(&payload).await {
                        return terminal;
                    }
                }
                Some(Ok(RawFrame::Done)) => return Terminal::Completed,
                Some(Err(err)) => {
                    return Terminal::Failed(GatewayError::Transport(format!(
                        "upstream read failed: {err}"
                    )));
                }
                None => {
                    return Terminal::Failed(GatewayError::Transport(
                        "upstream stream ended before completion".to_string(),
                    ));
                }
            }
        }
    }

    /// Race `fut` against the caller disconnecting.
    async fn until_caller_gone<F: Future>(&self, fut: F) -> Step<F::Output> {
        tokio::select! {
            biased;
            () = self.writer.closed() => Step::CallerGone,
            output = fut => Step::Ready(output),
        }
    }

    /// Transcode and write one data payload.
    ///
    /// Untranslatable frames are skipped. Returns a terminal outcome when the
    /// upstream reported an in-band error or the sink is gone.
    async fn emit_payload(&mut self, payload: &str) -> Option<Terminal> {
        self.next_frame_seq += 1;
        let frame_seq = self.next_frame_seq;
        let event = match transcode_data_payload(payload) {
            Ok(event) => event,
            Err(GatewayError::Translation(reason)) => {
                self.frames_skipped += 1;
                tracing::warn!(
                    session = %self.id,
                    frame_seq,
                    error = %reason,
                    "skipping upstream frame"
                );
                return None;
            }
            Err(err) => return Some(Terminal::Failed(err)),
        };

        if self.writer.write_delta(&event).await.is_err() {
            return Some(Terminal::Cancelled);
        }
        self.deltas_emitted += 1;
        self.transition(SessionState::Streaming);
        tracing::trace!(session = %self.id, frame_seq, "delta frame written");
        None
    }

    async fn finish(mut self, terminal: Terminal, started: Instant) -> SessionReport {
        let mut cancelled = false;
        let state = match terminal {
            Terminal::Completed => {
                if self.write_terminal(None).await {
                    SessionState::Completed
                } else {
                    cancelled = true;
                    SessionState::Errored
                }
            }
            Terminal::Failed(err) => {
                tracing::warn!(session = %self.id, error = %err, "stream session failed");
                if !self.write_terminal(Some(&err.client_message())).await {
                    cancelled = true;
                }
                SessionState::Errored
            }
            Terminal::Cancelled => {
                cancelled = true;
                SessionState::Errored
            }
        };
        if cancelled {
            tracing::debug!(session = %self.id, "caller disconnected, upstream read aborted");
        }

        // No-op when the terminal write already closed it.
        self.writer.close();
        self.transition(state);

        let report = SessionReport {
            state,
            deltas_emitted: self.deltas_emitted,
            frames_skipped: self.frames_skipped,
            cancelled,
        };
        log_session_complete(self.id, &report, started.elapsed());
        report
    }

    /// Write the sentinel (`None`) or an error frame. Returns `false` when the
    /// caller could not receive it.
    async fn write_terminal(&mut self, error_message: Option<&str>) -> bool {
        let write = async {
            match error_message {
                Some(message) => self.writer.write_error(message).await,
                None => self.writer.write_done().await,
            }
        };
        matches!(
            tokio::time::timeout(TERMINAL_WRITE_GRACE, write).await,
            Ok(Ok(()))
        )
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid session transition {:?} -> {next:?}",
            self.state
        );
        if self.state != next {
            tracing::debug!(session = %self.id, from = ?self.state, to = ?next, "session transition");
        }
        self.state = next;
    }
}
