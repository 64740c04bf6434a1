use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use chat_relay::config::{AppConfig, CorsConfig, FeaturesConfig, ServerConfig, UpstreamConfig};
use chat_relay::routing::dispatch_request;
use chat_relay::state::AppState;
use futures_util::StreamExt;
use serde_json::{json, Value};

const SCENARIO_A: &str = "data: {\"id\":\"x\",\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"Hi\"},\"finish_reason\":null}]}\n\ndata: [DONE]\n\n";

const SCENARIO_C: &str = "\
data: {\"id\":\"x\",\"choices\":[{\"delta\":{\"content\":\"one\"}}]}\n\n\
data: {\"id\":\"x\",\"choices\":[{\"delta\":\n\n\
data: {\"id\":\"x\",\"choices\":[{\"delta\":{\"content\":\"two\"},\"finish_reason\":\"stop\"}]}\n\n\
data: [DONE]\n\n";

const SCENARIO_D: &str = "data: {\"id\":\"x\",\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\ndata: [DONE]\n\n";

const NO_SENTINEL: &str = "data: {\"id\":\"x\",\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n";

const IN_BAND_ERROR: &str = "\
data: {\"id\":\"x\",\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\n\
data: {\"error\":{\"message\":\"overloaded\",\"type\":\"server_error\"}}\n\n\
data: [DONE]\n\n";

const MISSING_KEY_ENV: &str = "CHAT_RELAY_TEST_KEY_THAT_IS_NEVER_SET";

#[derive(Clone, Default)]
struct Captured {
    calls: Arc<AtomicUsize>,
    last: Arc<Mutex<Option<(HeaderMap, Value)>>>,
}

impl Captured {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last(&self) -> (HeaderMap, Value) {
        self.last
            .lock()
            .unwrap()
            .clone()
            .expect("upstream was called")
    }
}

fn config(base_url: String, api_key: Option<&str>) -> AppConfig {
    AppConfig {
        server: ServerConfig::default(),
        upstream: UpstreamConfig {
            base_url,
            api_key: api_key.map(str::to_string),
            api_key_env: MISSING_KEY_ENV.to_string(),
            model: "gpt-4o-mini".to_string(),
            proxy: None,
            temperature: Some(0.7),
            max_tokens: None,
            top_p: None,
        },
        cors: CorsConfig::default(),
        features: FeaturesConfig::default(),
    }
}

fn build_state(base_url: String) -> Arc<AppState> {
    Arc::new(AppState::from_config(config(base_url, Some("upstream-secret"))).unwrap())
}

fn event_stream(body: &'static str) -> Response {
    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

/// Serve `router` on an ephemeral port and return its `/v1` base URL.
async fn spawn_upstream(router: Router) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}/v1"), server)
}

/// Upstream that replays `body` and records each request it receives.
async fn spawn_replaying_upstream(
    body: &'static str,
) -> (String, Captured, tokio::task::JoinHandle<()>) {
    let captured = Captured::default();
    let router = Router::new()
        .route(
            "/v1/chat/completions",
            post(
                move |State(captured): State<Captured>,
                      headers: HeaderMap,
                      Json(payload): Json<Value>| async move {
                    captured.calls.fetch_add(1, Ordering::SeqCst);
                    *captured.last.lock().unwrap() = Some((headers, payload));
                    event_stream(body)
                },
            ),
        )
        .with_state(captured.clone());
    let (base_url, server) = spawn_upstream(router).await;
    (base_url, captured, server)
}

fn stream_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/stream")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ORIGIN, "https://app.example")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn hello() -> Value {
    json!({"messages": [{"role": "user", "content": "hello"}]})
}

async fn send(state: Arc<AppState>, request: Request<Body>) -> Response {
    dispatch_request(state, Arc::<str>::from(""), request)
        .await
        .unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

#[tokio::test]
async fn test_single_delta_stream_ends_with_sentinel() {
    let (base_url, _captured, server) = spawn_replaying_upstream(SCENARIO_A).await;
    let response = send(build_state(base_url), stream_request(hello())).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "*"
    );
    assert_eq!(
        body_text(response).await,
        "data: {\"id\":\"x\",\"delta\":{\"role\":\"assistant\",\"content\":\"Hi\"}}\n\ndata: [DONE]\n\n"
    );
    server.abort();
}

#[tokio::test]
async fn test_upstream_rate_limit_becomes_single_error_frame() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({"error": {"message": "rate limited", "type": "rate_limit_error"}})),
            )
        }),
    );
    let (base_url, server) = spawn_upstream(router).await;
    let response = send(build_state(base_url), stream_request(hello())).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_text(response).await,
        "data: {\"error\":{\"message\":\"rate limited\"}}\n\n"
    );
    server.abort();
}

#[tokio::test]
async fn test_malformed_frame_is_skipped_and_stream_continues() {
    let (base_url, _captured, server) = spawn_replaying_upstream(SCENARIO_C).await;
    let response = send(build_state(base_url), stream_request(hello())).await;

    let text = body_text(response).await;
    let frames: Vec<&str> = text.split_terminator("\n\n").collect();
    assert_eq!(
        frames,
        vec![
            "data: {\"id\":\"x\",\"delta\":{\"content\":\"one\"}}",
            "data: {\"id\":\"x\",\"delta\":{\"content\":\"two\"},\"finishReason\":\"stop\"}",
            "data: [DONE]",
        ]
    );
    server.abort();
}

#[tokio::test]
async fn test_missing_content_is_forwarded_as_empty_string() {
    let (base_url, _captured, server) = spawn_replaying_upstream(SCENARIO_D).await;
    let response = send(build_state(base_url), stream_request(hello())).await;

    let text = body_text(response).await;
    let first = text.split_terminator("\n\n").next().unwrap();
    let event: Value = serde_json::from_str(first.strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(event["delta"]["content"], "");
    assert_eq!(event["delta"]["role"], "assistant");
    assert!(event.get("finishReason").is_none());
    assert!(text.ends_with("data: [DONE]\n\n"));
    server.abort();
}

#[tokio::test]
async fn test_upstream_ending_without_sentinel_is_an_error() {
    let (base_url, _captured, server) = spawn_replaying_upstream(NO_SENTINEL).await;
    let response = send(build_state(base_url), stream_request(hello())).await;

    let text = body_text(response).await;
    let frames: Vec<&str> = text.split_terminator("\n\n").collect();
    assert_eq!(frames.len(), 2);
    assert!(frames[0].contains("\"content\":\"partial\""));
    assert!(frames[1].starts_with("data: {\"error\":{\"message\":"));
    assert!(!text.contains("[DONE]"));
    server.abort();
}

#[tokio::test]
async fn test_in_band_upstream_error_replaces_sentinel() {
    let (base_url, _captured, server) = spawn_replaying_upstream(IN_BAND_ERROR).await;
    let response = send(build_state(base_url), stream_request(hello())).await;

    assert_eq!(response.status(), StatusCode::OK);
    let text = body_text(response).await;
    let frames: Vec<&str> = text.split_terminator("\n\n").collect();
    assert_eq!(
        frames,
        vec![
            "data: {\"id\":\"x\",\"delta\":{\"content\":\"par\"}}",
            "data: {\"error\":{\"message\":\"overloaded\"}}",
        ]
    );
    assert!(!text.contains("[DONE]"));
    server.abort();
}

#[tokio::test]
async fn test_upstream_request_carries_credential_and_parameters() {
    let (base_url, captured, server) = spawn_replaying_upstream(SCENARIO_A).await;
    let response = send(
        build_state(base_url),
        stream_request(json!({
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hello"}
            ],
            "maxTokens": 64,
            "top_p": 0.5
        })),
    )
    .await;
    let _ = body_text(response).await;

    assert_eq!(captured.calls(), 1);
    let (headers, payload) = captured.last();
    assert_eq!(headers[header::AUTHORIZATION], "Bearer upstream-secret");
    assert_eq!(headers[header::ACCEPT], "text/event-stream");
    assert_eq!(
        payload,
        json!({
            "model": "gpt-4o-mini",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hello"}
            ],
            "stream": true,
            "temperature": 0.7,
            "max_tokens": 64,
            "top_p": 0.5
        })
    );
    server.abort();
}

#[tokio::test]
async fn test_query_envelope_is_accepted() {
    let (base_url, captured, server) = spawn_replaying_upstream(SCENARIO_A).await;
    let response = send(
        build_state(base_url),
        stream_request(json!({
            "query": "subscription Chat($input: ChatInput!) { chat(input: $input) }",
            "operationName": "Chat",
            "variables": {"input": {"messages": [{"role": "user", "content": "hi"}], "temperature": 0.1}}
        })),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.ends_with("data: [DONE]\n\n"));
    let (_, payload) = captured.last();
    assert_eq!(payload["messages"][0]["content"], "hi");
    assert_eq!(payload["temperature"], 0.1);
    server.abort();
}

#[tokio::test]
async fn test_missing_credential_is_rejected_before_upstream_call() {
    let (base_url, captured, server) = spawn_replaying_upstream(SCENARIO_A).await;
    let state = Arc::new(AppState::from_config(config(base_url, None)).unwrap());
    let response = send(state, stream_request(hello())).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "*"
    );
    let body = body_json(response).await;
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.contains("API key"), "unexpected message: {message}");
    assert!(message.contains(MISSING_KEY_ENV));
    assert_eq!(captured.calls(), 0);
    server.abort();
}

#[tokio::test]
async fn test_invalid_requests_are_rejected_with_400() {
    let (base_url, captured, server) = spawn_replaying_upstream(SCENARIO_A).await;
    let state = build_state(base_url);

    for body in [
        json!({"messages": []}),
        json!({"messages": [{"role": "tool", "content": "x"}]}),
        json!({"messages": [{"role": "user", "content": "x"}], "temperature": 3.5}),
        json!({"variables": "not an object"}),
    ] {
        let response = send(Arc::clone(&state), stream_request(body.clone())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
        let payload = body_json(response).await;
        assert!(payload["error"]["message"].is_string());
    }

    let malformed = Request::builder()
        .method("POST")
        .uri("/v1/chat/stream")
        .body(Body::from("{\"messages\": ["))
        .unwrap();
    let response = send(Arc::clone(&state), malformed).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(captured.calls(), 0);
    server.abort();
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let state = build_state("http://127.0.0.1:9/v1".to_string());
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/stream")
        .body(Body::from(vec![b' '; 2 * 1024 * 1024 + 1]))
        .unwrap();
    let response = send(state, request).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_health_reports_upstream_without_secret() {
    let state = build_state("http://127.0.0.1:9/v1".to_string());
    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = send(state, request).await;

    assert_eq!(response.status(), StatusCode::OK);
    let text = body_text(response).await;
    assert!(!text.contains("upstream-secret"));
    let body: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body["upstream"]["host"], "127.0.0.1:9");
    assert_eq!(body["upstream"]["model"], "gpt-4o-mini");
    assert_eq!(body["upstream"]["credential_configured"], true);
}

#[tokio::test]
async fn test_preflight_and_unknown_routes() {
    let state = build_state("http://127.0.0.1:9/v1".to_string());

    let preflight = Request::builder()
        .method("OPTIONS")
        .uri("/v1/chat/stream")
        .header(header::ORIGIN, "https://app.example")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let response = send(Arc::clone(&state), preflight).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "*"
    );
    assert!(response
        .headers()
        .contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));

    let preflight_elsewhere = Request::builder()
        .method("OPTIONS")
        .uri("/v1/models")
        .header(header::ORIGIN, "https://app.example")
        .body(Body::empty())
        .unwrap();
    assert_eq!(
        send(Arc::clone(&state), preflight_elsewhere).await.status(),
        StatusCode::NO_CONTENT
    );

    let wrong_method = Request::builder()
        .method("GET")
        .uri("/v1/chat/stream")
        .body(Body::empty())
        .unwrap();
    assert_eq!(
        send(Arc::clone(&state), wrong_method).await.status(),
        StatusCode::METHOD_NOT_ALLOWED
    );

    let unknown = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(state, unknown).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_base_path_prefixes_stream_route() {
    let (base_url, _captured, server) = spawn_replaying_upstream(SCENARIO_A).await;
    let state = build_state(base_url);
    let request = Request::builder()
        .method("POST")
        .uri("/relay/v1/chat/stream")
        .body(Body::from(hello().to_string()))
        .unwrap();
    let response = dispatch_request(state, Arc::<str>::from("/relay"), request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.ends_with("data: [DONE]\n\n"));
    server.abort();
}

/// Marks the upstream response body as released when dropped.
struct ReleaseFlag(Arc<AtomicBool>);

impl Drop for ReleaseFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_caller_disconnect_releases_upstream() {
    let released = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&released);
    let router = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let guard = ReleaseFlag(Arc::clone(&flag));
            async move {
                let frames = futures_util::stream::unfold(guard, |guard| async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let frame = Bytes::from_static(
                        b"data: {\"id\":\"x\",\"choices\":[{\"delta\":{\"content\":\"tick\"}}]}\n\n",
                    );
                    Some((Ok::<_, Infallible>(frame), guard))
                });
                (
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    Body::from_stream(frames),
                )
                    .into_response()
            }
        }),
    );
    let (base_url, server) = spawn_upstream(router).await;
    let response = send(build_state(base_url), stream_request(hello())).await;

    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    assert!(first.starts_with(b"data: {\"id\":\"x\""));
    drop(body);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !released.load(Ordering::SeqCst) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "upstream body was not released after caller disconnect"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    server.abort();
}
