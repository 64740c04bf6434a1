use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use super::cors::apply_cors_headers;
use crate::error::GatewayError;
use crate::observability::log_session_start;
use crate::protocol::{parse_chat_stream_request, UpstreamChatRequest};
use crate::state::AppState;
use crate::stream::{sse_body, SseWriter, StreamSession};
use crate::transport::open_upstream_stream;
use crate::util::next_session_id;

/// `POST {base_path}/v1/chat/stream`.
///
/// Request and credential problems are answered as buffered JSON errors before
/// any upstream call. Once the request is accepted the response is always an
/// event stream; upstream failures arrive as its single error frame.
pub async fn handler(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let mut response = match start_session(state.clone(), &body) {
        Ok(body) => sse_ok_response(body),
        Err(err) => {
            tracing::debug!(error = %err, "chat stream request rejected");
            err.into_response()
        }
    };
    apply_cors_headers(&state.config.cors, &headers, &mut response);
    response
}

fn start_session(state: Arc<AppState>, body: &[u8]) -> Result<axum::body::Body, GatewayError> {
    let request = parse_chat_stream_request(body)?;
    let api_key = state.upstream_api_key()?;
    let upstream_request = UpstreamChatRequest::new(&request, &state.upstream);
    let upstream_body = upstream_request.to_body()?;

    let session_id = next_session_id();
    log_session_start(session_id, upstream_request.model, request.messages.len());

    let (writer, rx) = SseWriter::channel();
    let max_duration = Duration::from_secs(state.config.server.stream_max_duration_secs);
    let session = StreamSession::new(session_id, writer, max_duration);
    tokio::spawn(async move {
        let connect = open_upstream_stream(&state.transport, &state.upstream, &api_key, upstream_body);
        session.run(connect).await;
    });

    Ok(sse_body(rx))
}

fn sse_ok_response(body: axum::body::Body) -> Response {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}
