use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{self, Body};
use axum::extract::State;
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::api::{chat_stream, cors, health};
use crate::error::GatewayError;
use crate::state::AppState;

const DEFAULT_BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

const CHAT_STREAM_PATH: &str = "/v1/chat/stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteMatch {
    Health,
    ChatStream,
    Preflight,
    MethodNotAllowed,
    NotFound,
}

/// Dispatch a raw HTTP request to the matching handler.
///
/// # Errors
///
/// This function currently never returns `Err` and uses `Infallible`.
pub async fn dispatch_request(
    state: Arc<AppState>,
    base_path: Arc<str>,
    request: Request<Body>,
) -> Result<Response, Infallible> {
    let (parts, body) = request.into_parts();
    let route = match_route(&parts.method, parts.uri.path(), base_path.as_ref());

    let response = match route {
        RouteMatch::Health => health::health_handler(State(state)).into_response(),
        RouteMatch::Preflight => cors::preflight_response(&state.config.cors, &parts.headers),
        RouteMatch::ChatStream => {
            let body_bytes = match read_request_body(body).await {
                Ok(bytes) => bytes,
                Err(mut response) => {
                    cors::apply_cors_headers(&state.config.cors, &parts.headers, &mut response);
                    return Ok(response);
                }
            };
            chat_stream::handler(State(state), parts.headers, body_bytes).await
        }
        RouteMatch::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        RouteMatch::NotFound => StatusCode::NOT_FOUND.into_response(),
    };

    Ok(response)
}

#[must_use]
pub fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim();
    if trimmed.is_empty() || trimmed == "/" {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.trim_end_matches('/').to_string()
    } else {
        format!("/{}", trimmed.trim_end_matches('/'))
    }
}

async fn read_request_body(body: Body) -> Result<bytes::Bytes, Response> {
    body::to_bytes(body, DEFAULT_BODY_LIMIT_BYTES)
        .await
        .map_err(|_| {
            let (_, payload) = crate::error::format_error(&GatewayError::InvalidRequest(
                "request body too large (max 2MiB)".to_string(),
            ));
            (StatusCode::PAYLOAD_TOO_LARGE, axum::Json(payload)).into_response()
        })
}

fn match_route(method: &Method, path: &str, base_path: &str) -> RouteMatch {
    let Some(path) = strip_base_path(path, base_path) else {
        return RouteMatch::NotFound;
    };

    if method == Method::OPTIONS {
        return RouteMatch::Preflight;
    }

    match path {
        "/" => {
            if method == Method::GET {
                RouteMatch::Health
            } else {
                RouteMatch::MethodNotAllowed
            }
        }
        CHAT_STREAM_PATH => {
            if method == Method::POST {
                RouteMatch::ChatStream
            } else {
                RouteMatch::MethodNotAllowed
            }
        }
        _ => RouteMatch::NotFound,
    }
}

fn strip_base_path<'a>(path: &'a str, base_path: &str) -> Option<&'a str> {
    if base_path.is_empty() {
        return Some(path);
    }

    let remainder = path.strip_prefix(base_path)?;
    if remainder.is_empty() {
        Some("/")
    } else if remainder.starts_with('/') {
        Some(remainder)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_path() {
        assert_eq!(normalize_base_path(""), "");
        assert_eq!(normalize_base_path("/"), "");
        assert_eq!(normalize_base_path("relay/"), "/relay");
        assert_eq!(normalize_base_path(" /relay// "), "/relay");
    }

    #[test]
    fn test_routes_without_base_path() {
        assert_eq!(match_route(&Method::GET, "/", ""), RouteMatch::Health);
        assert_eq!(
            match_route(&Method::POST, "/v1/chat/stream", ""),
            RouteMatch::ChatStream
        );
        assert_eq!(
            match_route(&Method::GET, "/v1/chat/stream", ""),
            RouteMatch::MethodNotAllowed
        );
        assert_eq!(
            match_route(&Method::OPTIONS, "/v1/chat/stream", ""),
            RouteMatch::Preflight
        );
        assert_eq!(
            match_route(&Method::POST, "/v1/chat/completions", ""),
            RouteMatch::NotFound
        );
    }

    #[test]
    fn test_preflight_on_any_path_under_base_path() {
        assert_eq!(
            match_route(&Method::OPTIONS, "/v1/models", ""),
            RouteMatch::Preflight
        );
        assert_eq!(
            match_route(&Method::OPTIONS, "/relay/anything", "/relay"),
            RouteMatch::Preflight
        );
        assert_eq!(
            match_route(&Method::OPTIONS, "/other/v1/chat/stream", "/relay"),
            RouteMatch::NotFound
        );
    }

    #[test]
    fn test_routes_under_base_path() {
        assert_eq!(
            match_route(&Method::POST, "/relay/v1/chat/stream", "/relay"),
            RouteMatch::ChatStream
        );
        assert_eq!(match_route(&Method::GET, "/relay", "/relay"), RouteMatch::Health);
        assert_eq!(
            match_route(&Method::POST, "/relayer/v1/chat/stream", "/relay"),
            RouteMatch::NotFound
        );
        assert_eq!(
            match_route(&Method::POST, "/v1/chat/stream", "/relay"),
            RouteMatch::NotFound
        );
    }
}
