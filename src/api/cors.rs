use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::config::CorsConfig;

const ALLOW_METHODS: &str = "GET, POST, OPTIONS";
const ALLOW_HEADERS_FALLBACK: &str = "content-type, authorization";

/// Origin to echo back, or `None` when the request origin is not allowed.
///
/// A wildcard entry answers `*` regardless of the request.
fn allowed_origin(cors: &CorsConfig, request_headers: &HeaderMap) -> Option<HeaderValue> {
    if cors.allowed_origins.iter().any(|origin| origin == "*") {
        return Some(HeaderValue::from_static("*"));
    }
    let origin = request_headers.get(header::ORIGIN)?;
    let origin_str = origin.to_str().ok()?;
    cors.allowed_origins
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(origin_str))
        .then(|| origin.clone())
}

/// Attach `access-control-allow-origin` (and `vary` for echoed origins).
pub fn apply_cors_headers(cors: &CorsConfig, request_headers: &HeaderMap, response: &mut Response) {
    let Some(origin) = allowed_origin(cors, request_headers) else {
        return;
    };
    let headers = response.headers_mut();
    if origin != "*" {
        headers.insert(header::VARY, HeaderValue::from_static("origin"));
    }
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
}

/// Answer a CORS preflight with 204.
#[must_use]
pub fn preflight_response(cors: &CorsConfig, request_headers: &HeaderMap) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    apply_cors_headers(cors, request_headers, &mut response);

    let allow_headers = request_headers
        .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(ALLOW_HEADERS_FALLBACK));
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, allow_headers);
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from(cors.max_age_secs));
    response
}
