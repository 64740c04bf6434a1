//! Canned chat-completion upstream for manual runs against a local relay.
//!
//! `UPSTREAM_PORT` (default 19001), `MOCK_SCENARIO` = text | slow | malformed | error | stream_error | truncated,
//! `MOCK_DRIP_MS` (default 250) paces the `slow` scenario.

use std::convert::Infallible;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt as _;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;

const DEFAULT_UPSTREAM_PORT: u16 = 19_001;
const DEFAULT_DRIP_MS: u64 = 250;

type MockBody = UnsyncBoxBody<Bytes, Infallible>;

#[derive(Copy, Clone, Debug)]
enum MockScenario {
    Text,
    Slow,
    Malformed,
    Error,
    StreamError,
    Truncated,
}

impl MockScenario {
    fn name(self) -> &'static str {
        match self {
            MockScenario::Text => "text",
            MockScenario::Slow => "slow",
            MockScenario::Malformed => "malformed",
            MockScenario::Error => "error",
            MockScenario::StreamError => "stream_error",
            MockScenario::Truncated => "truncated",
        }
    }
}

struct MockState {
    scenario: MockScenario,
    drip: Duration,
    requests: AtomicU64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let port = env_u64("UPSTREAM_PORT", u64::from(DEFAULT_UPSTREAM_PORT))
        .try_into()
        .unwrap_or(DEFAULT_UPSTREAM_PORT);
    let state = Arc::new(MockState {
        scenario: parse_scenario(),
        drip: Duration::from_millis(env_u64("MOCK_DRIP_MS", DEFAULT_DRIP_MS)),
        requests: AtomicU64::new(0),
    });

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap_or_else(|err| panic!("failed to bind mock upstream on 127.0.0.1:{port}: {err}"));
    eprintln!(
        "mock upstream on http://127.0.0.1:{port}/v1 (scenario={})",
        state.scenario.name()
    );

    let conn_builder = AutoBuilder::new(TokioExecutor::new());
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                eprintln!("accept error: {err}");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let conn_builder = conn_builder.clone();
        let service_state = Arc::clone(&state);
        let service = service_fn(move |request: Request<Incoming>| {
            let state_ref = Arc::clone(&service_state);
            async move { Ok::<_, Infallible>(handle_request(request, &state_ref).await) }
        });

        tokio::spawn(async move {
            if let Err(err) = conn_builder.serve_connection(io, service).await {
                eprintln!("mock upstream connection error from {remote_addr}: {err}");
            }
        });
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_scenario() -> MockScenario {
    match env::var("MOCK_SCENARIO").as_deref() {
        Ok("slow") => MockScenario::Slow,
        Ok("malformed") => MockScenario::Malformed,
        Ok("error") => MockScenario::Error,
        Ok("stream_error") => MockScenario::StreamError,
        Ok("truncated") => MockScenario::Truncated,
        Ok("text") | Err(_) => MockScenario::Text,
        Ok(other) => {
            eprintln!("unknown MOCK_SCENARIO '{other}', fallback to text");
            MockScenario::Text
        }
    }
}

async fn handle_request(request: Request<Incoming>, state: &MockState) -> Response<MockBody> {
    let (parts, body) = request.into_parts();
    let request_body = body
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();
    let path = parts.uri.path();

    if parts.method == Method::GET && path == "/_mock/stats" {
        let body = format!(
            "{{\"scenario\":\"{}\",\"requests\":{}}}",
            state.scenario.name(),
            state.requests.load(Ordering::Relaxed)
        );
        return full_response(StatusCode::OK, "application/json", Bytes::from(body));
    }
    if parts.method != Method::POST {
        return full_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "application/json",
            Bytes::from_static(br#"{"error":{"message":"method not allowed"}}"#),
        );
    }
    if !matches!(path, "/v1/chat/completions" | "/chat/completions") {
        return full_response(
            StatusCode::NOT_FOUND,
            "application/json",
            Bytes::from_static(br#"{"error":{"message":"not found"}}"#),
        );
    }

    let seq = state.requests.fetch_add(1, Ordering::Relaxed) + 1;
    let authorized = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("Bearer "));
    eprintln!(
        "request #{seq}: {} bytes, bearer={authorized}",
        request_body.len()
    );
    if !authorized {
        return full_response(
            StatusCode::UNAUTHORIZED,
            "application/json",
            Bytes::from_static(br#"{"error":{"message":"missing bearer token"}}"#),
        );
    }

    match state.scenario {
        MockScenario::Text => event_stream_response(full_body(Bytes::from_static(STREAM_TEXT))),
        MockScenario::Malformed => {
            event_stream_response(full_body(Bytes::from_static(STREAM_MALFORMED)))
        }
        MockScenario::Truncated => {
            event_stream_response(full_body(Bytes::from_static(STREAM_TRUNCATED)))
        }
        MockScenario::StreamError => {
            event_stream_response(full_body(Bytes::from_static(STREAM_IN_BAND_ERROR)))
        }
        MockScenario::Slow => event_stream_response(drip_body(state.drip)),
        MockScenario::Error => full_response(
            StatusCode::TOO_MANY_REQUESTS,
            "application/json",
            Bytes::from_static(br#"{"error":{"message":"rate limited","type":"rate_limit_error"}}"#),
        ),
    }
}

/// One frame per tick, split mid-line and mid-character to exercise reassembly.
fn drip_body(tick: Duration) -> MockBody {
    let pieces = STREAM_DRIP.iter().map(|piece| Bytes::from_static(*piece));
    let frames = futures_util::stream::iter(pieces).then(move |piece| async move {
        tokio::time::sleep(tick).await;
        Ok::<_, Infallible>(Frame::data(piece))
    });
    StreamBody::new(frames).boxed_unsync()
}

fn full_body(bytes: Bytes) -> MockBody {
    Full::new(bytes).boxed_unsync()
}

fn event_stream_response(body: MockBody) -> Response<MockBody> {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn full_response(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<MockBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

const STREAM_TEXT: &[u8] = b": mock upstream\n\ndata: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m1\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"finish_reason\":null}]}\n\ndata: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\ndata: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m1\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n";
const STREAM_MALFORMED: &[u8] = b"data: {\"id\":\"chatcmpl-mock\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"before\"}}]}\n\ndata: {\"id\":\"chatcmpl-mock\",\"choices\":[{\"index\":0,\"delta\":\n\ndata: {\"id\":\"chatcmpl-mock\",\"choices\":[]}\n\ndata: {\"id\":\"chatcmpl-mock\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\" after\"},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n";
const STREAM_TRUNCATED: &[u8] = b"data: {\"id\":\"chatcmpl-mock\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"cut\"}}]}\n\n";
const STREAM_IN_BAND_ERROR: &[u8] = b"data: {\"id\":\"chatcmpl-mock\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"par\"}}]}\n\ndata: {\"error\":{\"message\":\"overloaded\",\"type\":\"server_error\"}}\n\ndata: [DONE]\n\n";
const STREAM_DRIP: &[&[u8]] = &[
    b"data: {\"id\":\"chatcmpl-drip\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"caf\xc3",
    b"\xa9 \xf0\x9f",
    b"\x98\x80\"},\"finish_reason\":null}]}\n",
    b"\ndata: {\"id\":\"chatcmpl-drip\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\" ok\"},\"finish_reason\":\"stop\"}]}\r\n\r\n",
    b"data: [DONE]\n\n",
];
