//! Upstream stream reader: one outbound request, body handed back as a byte stream.

use std::fmt;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};

use super::{HttpTransport, PreparedUpstream};
use crate::error::GatewayError;
use crate::util::truncate_utf8;

const MAX_UPSTREAM_ERROR_LEN: usize = 500;
/// Non-success bodies are read only up to this many bytes.
const MAX_ERROR_BODY_BYTES: usize = 4 * 1024;

/// Send the prepared request body upstream and return the response body as a stream.
///
/// The body is never buffered on success. On a non-success status at most
/// 4 KiB of the error body is read and turned into [`GatewayError::Upstream`].
///
/// # Errors
///
/// Returns [`GatewayError::Transport`] on connection failure and
/// [`GatewayError::Upstream`] on a non-success status.
pub async fn open_upstream_stream(
    transport: &HttpTransport,
    upstream: &PreparedUpstream,
    api_key: &str,
    body: Bytes,
) -> Result<impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static, GatewayError> {
    let headers = upstream.build_headers(api_key)?;
    let response = transport
        .send_stream(upstream.completions_url(), &headers, body)
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = read_error_body(response.bytes_stream(), MAX_ERROR_BODY_BYTES).await?;
        return Err(GatewayError::Upstream {
            status: status.as_u16(),
            message: upstream_error_message(status, &body),
        });
    }

    tracing::debug!(status = status.as_u16(), upstream = %upstream.host(), "upstream stream opened");
    Ok(response.bytes_stream())
}

/// Collect at most `limit` bytes of an error body; the rest is never read.
async fn read_error_body<S, E>(body: S, limit: usize) -> Result<Bytes, GatewayError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: fmt::Display,
{
    let mut body = Box::pin(body);
    let mut collected = BytesMut::new();
    while collected.len() < limit {
        let Some(chunk) = body.next().await else {
            break;
        };
        let chunk = chunk.map_err(|err| {
            GatewayError::Transport(format!("failed to read upstream error body: {err}"))
        })?;
        let take = chunk.len().min(limit - collected.len());
        collected.extend_from_slice(&chunk[..take]);
    }
    Ok(collected.freeze())
}

/// `error.message` from a JSON error body, else the raw body text, capped at 500 bytes.
pub(crate) fn upstream_error_message(status: http::StatusCode, body: &[u8]) -> String {
    let from_json = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|json| {
            json.get("error")
                .and_then(|error| error.get("message"))
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        });
    let message = from_json.unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
    if message.is_empty() {
        return format!("upstream returned status {}", status.as_u16());
    }
    if message.len() > MAX_UPSTREAM_ERROR_LEN {
        return format!("{}...", truncate_utf8(&message, MAX_UPSTREAM_ERROR_LEN));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[test]
    fn test_json_error_message_is_extracted() {
        assert_eq!(
            upstream_error_message(
                StatusCode::TOO_MANY_REQUESTS,
                br#"{"error":{"message":"rate limited","type":"rate_limit"}}"#
            ),
            "rate limited"
        );
    }

    #[test]
    fn test_non_json_body_passes_through_raw() {
        assert_eq!(
            upstream_error_message(StatusCode::BAD_GATEWAY, b"bad gateway\n"),
            "bad gateway"
        );
    }

    #[test]
    fn test_json_without_message_uses_raw_body() {
        assert_eq!(
            upstream_error_message(StatusCode::BAD_REQUEST, br#"{"detail":"nope"}"#),
            r#"{"detail":"nope"}"#
        );
    }

    #[test]
    fn test_empty_body_reports_status() {
        assert_eq!(
            upstream_error_message(StatusCode::SERVICE_UNAVAILABLE, b""),
            "upstream returned status 503"
        );
    }

    #[test]
    fn test_long_body_is_truncated() {
        let body = "\u{e9}".repeat(400);
        let message = upstream_error_message(StatusCode::INTERNAL_SERVER_ERROR, body.as_bytes());
        assert!(message.ends_with("..."));
        assert_eq!(message.len(), 500 + 3);
    }

    #[tokio::test]
    async fn test_error_body_read_stops_at_limit() {
        let polled = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = std::sync::Arc::clone(&polled);
        let endless = futures_util::stream::repeat_with(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok::<_, std::convert::Infallible>(Bytes::from_static(&[b'x'; 1000]))
        });
        let body = read_error_body(endless, 4096).await.unwrap();
        assert_eq!(body.len(), 4096);
        assert_eq!(polled.load(std::sync::atomic::Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_short_error_body_is_read_whole() {
        let chunks = futures_util::stream::iter(vec![
            Ok::<_, std::convert::Infallible>(Bytes::from_static(br#"{"error":{"mess"#)),
            Ok(Bytes::from_static(br#"age":"rate limited"}}"#)),
        ]);
        let body = read_error_body(chunks, 4096).await.unwrap();
        assert_eq!(
            upstream_error_message(StatusCode::TOO_MANY_REQUESTS, &body),
            "rate limited"
        );
    }

    #[tokio::test]
    async fn test_error_body_read_failure_is_transport_error() {
        let chunks = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err("connection reset"),
        ]);
        let err = read_error_body(chunks, 4096).await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
        assert!(err.to_string().contains("connection reset"));
    }
}
