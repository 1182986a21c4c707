//! Reverse-proxy handlers for the application origin and the backend REST
//! API.  Request and response bodies are streamed, never buffered.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    response::Response,
};
use tracing::debug;

use crate::backend::Session;
use crate::gate::paths::BACKEND_PROXY_PREFIX;
use crate::metrics::{UpstreamLabels, UpstreamTarget};
use crate::AppState;

use super::handler::AppError;

/// Identity header handed to the application.  Never taken from the client.
pub const USER_ID_HEADER: &str = "x-gate-user-id";

const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Additionally dropped on backend passthrough requests.
const BACKEND_STRIPPED: &[HeaderName] = &[
    header::HOST,
    header::ORIGIN,
    header::REFERER,
    header::CONTENT_LENGTH,
];

/// Fallback handler: forward to the application origin.
pub async fn forward_to_app(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, AppError> {
    let session = request
        .extensions()
        .get::<Session>()
        .cloned()
        .unwrap_or_default();
    let url = join_url(&state.config.upstream.app_url, request_target(&request));

    let (parts, body) = request.into_parts();
    let mut headers = forwarded_headers(&parts.headers, &[header::HOST]);
    if let Some(user_id) = session.user_id.as_deref() {
        let value = HeaderValue::from_str(user_id)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("user id not header-safe: {e}")))?;
        headers.insert(USER_ID_HEADER, value);
    }

    debug!(%url, method = %parts.method, "forwarding to app");
    let upstream = state
        .http_client
        .request(parts.method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await
        .map_err(|e| AppError::BadGateway(format!("app origin unreachable: {e}")))?;

    count(&state, UpstreamTarget::App);
    Ok(stream_response(upstream))
}

/// `ANY /api-proxy/{*path}`: forward to the backend with its API key.
///
/// The target is taken from the (already normalized) request URI rather
/// than the route capture.
pub async fn forward_to_backend(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, AppError> {
    let target = request_target(&request);
    let target = target.strip_prefix(BACKEND_PROXY_PREFIX).unwrap_or(target);
    let url = join_url(&state.config.backend.url, target);

    let (parts, body) = request.into_parts();
    let mut headers = forwarded_headers(&parts.headers, BACKEND_STRIPPED);
    let apikey = HeaderValue::from_str(&state.backend_key)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("backend key not header-safe: {e}")))?;
    headers.insert("apikey", apikey);

    debug!(%url, method = %parts.method, "forwarding to backend");
    let upstream = state
        .http_client
        .request(parts.method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await
        .map_err(|e| AppError::BadGateway(format!("backend unreachable: {e}")))?;

    count(&state, UpstreamTarget::Backend);
    Ok(stream_response(upstream))
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn count(state: &AppState, target: UpstreamTarget) {
    state
        .metrics
        .metrics
        .upstream_requests_total
        .get_or_create(&UpstreamLabels { target })
        .inc();
}

/// Path and query of the inbound request.
fn request_target(request: &Request) -> &str {
    request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
}

fn join_url(base: &str, target: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), target)
}

/// Copy client headers, minus hop-by-hop headers, `extra` and any
/// client-supplied identity header.
fn forwarded_headers(incoming: &HeaderMap, extra: &[HeaderName]) -> HeaderMap {
    let mut headers = incoming.clone();
    for name in HOP_BY_HOP.iter().chain(extra) {
        headers.remove(name);
    }
    headers.remove(USER_ID_HEADER);
    headers
}

/// Turn an upstream reply into a streamed axum response.
fn stream_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    for name in HOP_BY_HOP {
        headers.remove(name);
    }

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{self, StatusCode};
    use axum::response::IntoResponse;
    use axum::Router;
    use tower::ServiceExt;

    use crate::gate::tests::harness;
    use crate::http::handler::create_router;
    use crate::http::handler::tests::test_state;

    /// Echo server describing what it received.
    async fn origin() -> String {
        async fn echo(request: Request) -> Response {
            let (parts, body) = request.into_parts();
            let header = |name: &str| {
                parts
                    .headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-")
                    .to_string()
            };
            let line = format!(
                "{} {} user={} apikey={} origin={} auth={}",
                parts.method,
                parts.uri,
                header(USER_ID_HEADER),
                header("apikey"),
                header("origin"),
                header("authorization"),
            );
            let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
            let text = if parts.method == http::Method::POST {
                format!("{line} body={}", String::from_utf8_lossy(&body))
            } else {
                line
            };
            (
                [
                    (header::CONTENT_RANGE, "bytes 0-9/10"),
                    (header::CACHE_CONTROL, "no-store"),
                ],
                text,
            )
                .into_response()
        }

        let app = Router::new().fallback(echo);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn req(method: &str, path: &str, headers: &[(&str, &str)], body: &str) -> Request {
        let mut builder = http::Request::builder().method(method).uri(path);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_app_receives_user_id_and_response_is_filtered() {
        let url = origin().await;
        let app = create_router(test_state(harness(false, false), &url, &url, None));
        let response = app
            .oneshot(req(
                "GET",
                "/planning?week=3",
                &[("authorization", "Bearer u1"), (USER_ID_HEADER, "spoofed")],
                "",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-9/10");
        assert!(response.headers().get(header::CACHE_CONTROL).is_none());
        let body = text(response).await;
        assert!(body.starts_with("GET /planning?week=3 user=u1 "), "{body}");
    }

    #[tokio::test]
    async fn test_spoofed_identity_stripped_for_anonymous() {
        let url = origin().await;
        let app = create_router(test_state(harness(false, false), &url, &url, None));
        let response = app
            .oneshot(req("GET", "/auth/login", &[(USER_ID_HEADER, "admin-1")], ""))
            .await
            .unwrap();
        // Public route: upstream headers pass through untouched.
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
        let body = text(response).await;
        assert!(body.contains(" user=- "), "{body}");
    }

    #[tokio::test]
    async fn test_app_post_body_streamed() {
        let url = origin().await;
        let app = create_router(test_state(harness(false, false), &url, &url, None));
        let response = app
            .oneshot(req("POST", "/auth/login", &[], "email=a%40b"))
            .await
            .unwrap();
        let body = text(response).await;
        assert!(body.starts_with("POST /auth/login "), "{body}");
        assert!(body.ends_with("body=email=a%40b"), "{body}");
    }

    #[tokio::test]
    async fn test_backend_passthrough_injects_key_and_strips_origin() {
        let url = origin().await;
        let app = create_router(test_state(harness(false, false), &url, &url, None));
        let response = app
            .oneshot(req(
                "GET",
                "/api-proxy/rest/v1/orders?select=*",
                &[
                    ("authorization", "Bearer u1"),
                    ("origin", "https://evil.example"),
                    ("referer", "https://evil.example/x"),
                ],
                "",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = text(response).await;
        assert!(body.starts_with("GET /rest/v1/orders?select=* "), "{body}");
        assert!(body.contains("apikey=anon-key"), "{body}");
        assert!(body.contains("origin=-"), "{body}");
        assert!(body.contains("auth=Bearer u1"), "{body}");
    }

    #[tokio::test]
    async fn test_backend_passthrough_requires_login() {
        let url = origin().await;
        let app = create_router(test_state(harness(false, false), &url, &url, None));
        let response = app
            .oneshot(req("GET", "/api-proxy/rest/v1/orders", &[], ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/");
    }

    #[tokio::test]
    async fn test_backend_down_is_502_json() {
        let app = create_router(test_state(
            harness(false, false),
            "http://127.0.0.1:9",
            "http://127.0.0.1:9",
            None,
        ));
        let response = app
            .oneshot(req("GET", "/api-proxy/rest/v1/x", &[("authorization", "Bearer u1")], ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json: serde_json::Value = serde_json::from_str(&text(response).await).unwrap();
        assert!(json["error"].as_str().unwrap().contains("backend unreachable"));
    }

    #[tokio::test]
    async fn test_dot_segment_paths_never_reach_upstream() {
        let url = origin().await;
        for (maintenance, gate, path) in [
            (false, false, "/auth/../admin/users"),
            (false, true, "/gate/../accueil"),
            (true, false, "/maintenance/../admin/x"),
            (false, false, "/api-proxy/rest/v1/%2e%2e/%2e%2e/admin"),
        ] {
            let app = create_router(test_state(harness(maintenance, gate), &url, &url, None));
            let response = app.oneshot(req("GET", path, &[], "")).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{path}");
        }
    }

    #[tokio::test]
    async fn test_anonymous_static_looking_paths_stay_protected() {
        let url = origin().await;
        for path in ["/api-proxy/rest/v1/profiles.txt?select=*", "/admin/users.js"] {
            let app = create_router(test_state(harness(false, false), &url, &url, None));
            let response = app.oneshot(req("GET", path, &[], "")).await.unwrap();
            assert_eq!(response.status(), StatusCode::SEE_OTHER, "{path}");
            assert_eq!(response.headers()[header::LOCATION], "/");
        }
    }

    #[tokio::test]
    async fn test_backend_passthrough_uses_collapsed_path() {
        let url = origin().await;
        let app = create_router(test_state(harness(false, false), &url, &url, None));
        let response = app
            .oneshot(req(
                "GET",
                "/api-proxy/rest//v1/orders?id=eq.1",
                &[("authorization", "Bearer u1")],
                "",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = text(response).await;
        assert!(body.starts_with("GET /rest/v1/orders?id=eq.1 "), "{body}");
    }

    #[test]
    fn test_forwarded_headers_strip() {
        let mut incoming = HeaderMap::new();
        incoming.insert(header::HOST, "gate.example".parse().unwrap());
        incoming.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        incoming.insert(header::COOKIE, "a=1".parse().unwrap());
        incoming.insert(USER_ID_HEADER, "spoof".parse().unwrap());
        let out = forwarded_headers(&incoming, &[header::HOST]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[header::COOKIE], "a=1");
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://app/", "/x?y=1"), "http://app/x?y=1");
        assert_eq!(join_url("http://app", "/"), "http://app/");
    }
}
