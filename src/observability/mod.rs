use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::stream::{SessionReport, SessionState};

/// Map a config log level onto a tracing filter directive.
///
/// - "DISABLED" -> `None` (no subscriber installed)
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (DEBUG, INFO, ERROR, TRACE)
#[must_use]
pub fn filter_directive(log_level: &str) -> Option<String> {
    let level = log_level.trim().to_uppercase();
    match level.as_str() {
        "DISABLED" => None,
        "WARNING" => Some("WARN".to_string()),
        "CRITICAL" => Some("ERROR".to_string()),
        _ => Some(level),
    }
}

/// Initialize the tracing subscriber with the configured log level.
pub fn init_tracing(log_level: &str) {
    let Some(directive) = filter_directive(log_level) else {
        return;
    };

    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("INFO"));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

pub fn log_session_start(session: uuid::Uuid, model: &str, message_count: usize) {
    tracing::info!(%session, model, message_count, "stream session started");
}

/// Log the terminal state of a session with its frame accounting.
pub fn log_session_complete(session: uuid::Uuid, report: &SessionReport, elapsed: Duration) {
    let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    match report.state {
        SessionState::Completed => tracing::info!(
            %session,
            deltas = report.deltas_emitted,
            skipped = report.frames_skipped,
            elapsed_ms,
            "stream session completed"
        ),
        _ => tracing::info!(
            %session,
            state = ?report.state,
            cancelled = report.cancelled,
            deltas = report.deltas_emitted,
            skipped = report.frames_skipped,
            elapsed_ms,
            "stream session ended"
        ),
    }
}
