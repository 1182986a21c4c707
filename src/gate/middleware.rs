//! axum layer running [`RequestGate`] in front of every gated route.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use tracing::debug;

use super::paths::normalize_path;
use super::{Decision, RequestGate, ResponseHeaders};
use crate::backend::RequestCredentials;

/// Evaluate the gate; redirect (303) or run the inner service with the
/// resolved [`Session`](crate::backend::Session) in the request extensions.
///
/// The path is normalized first and the request rewritten to it, so the
/// upstream sees exactly the path that was classified.  Dot segments are
/// refused with 400.
pub async fn gate_middleware(
    State(gate): State<Arc<RequestGate>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(path) = normalize_path(request.uri().path()) else {
        debug!(uri = %request.uri(), "rejecting path with dot segments");
        return (StatusCode::BAD_REQUEST, "invalid request path").into_response();
    };
    if path != request.uri().path() {
        match with_path(request.uri(), &path) {
            Some(uri) => *request.uri_mut() = uri,
            None => return (StatusCode::BAD_REQUEST, "invalid request path").into_response(),
        }
    }

    let credentials = RequestCredentials::from_headers(request.headers());
    let verdict = gate.evaluate(&path, &credentials).await;

    match verdict.decision {
        Decision::Redirect(to) => {
            debug!(
                method = %request.method(),
                %path,
                rule = verdict.rule.as_str(),
                outcome = "redirect",
                location = %to,
                "gate decision"
            );
            Redirect::to(&to).into_response()
        }
        Decision::Proceed { session, headers } => {
            debug!(
                method = %request.method(),
                %path,
                rule = verdict.rule.as_str(),
                outcome = "proceed",
                authenticated = session.is_authenticated(),
                "gate decision"
            );
            request.extensions_mut().insert(session);
            let mut response = next.run(request).await;
            if headers == ResponseHeaders::Filtered {
                gate.filter_response_headers(response.headers_mut());
            }
            response
        }
    }
}

/// `uri` with its path replaced, query kept.
fn with_path(uri: &Uri, path: &str) -> Option<Uri> {
    let path_and_query = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_owned(),
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query.parse().ok()?);
    Uri::from_parts(parts).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{self, header, HeaderMap, StatusCode};
    use axum::{Extension, Router};
    use tower::ServiceExt;

    use crate::backend::Session;
    use crate::gate::tests::{harness, unsigned_pass, NOW};

    async fn echo_session(
        Extension(session): Extension<Session>,
        uri: Uri,
    ) -> impl IntoResponse {
        let mut headers = HeaderMap::new();
        headers.insert("x-seen-uri", uri.to_string().parse().unwrap());
        headers.insert(header::CONTENT_RANGE, "bytes 0-1/2".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
        headers.insert("x-internal", "leak".parse().unwrap());
        (headers, session.user_id.unwrap_or_else(|| "anon".into()))
    }

    fn router(gate: RequestGate) -> Router {
        let gate = Arc::new(gate);
        Router::new()
            .fallback(echo_session)
            .layer(axum::middleware::from_fn_with_state(gate, gate_middleware))
    }

    fn request(path: &str, bearer: Option<&str>, cookie: Option<String>) -> Request {
        let mut builder = http::Request::builder().uri(path);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_redirect_is_303_with_location() {
        let app = router(harness(false, true).gate);
        let response = app.oneshot(request("/", None, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/gate");
    }

    #[tokio::test]
    async fn test_pass_cookie_read_from_cookie_header() {
        let app = router(harness(false, true).gate);
        let cookie = format!("other=1; gate_pass={}", unsigned_pass(NOW + 60_000));
        let response = app.oneshot(request("/", None, Some(cookie))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "anon");
    }

    #[tokio::test]
    async fn test_protected_response_headers_filtered() {
        let app = router(harness(false, false).gate);
        let response = app
            .oneshot(request("/accueil", Some("u1"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-1/2");
        assert!(response.headers().get(header::CONTENT_TYPE).is_none());
        assert!(response.headers().get("x-internal").is_none());
        assert_eq!(body_text(response).await, "u1");
    }

    #[tokio::test]
    async fn test_public_response_headers_untouched() {
        let app = router(harness(false, false).gate);
        let response = app.oneshot(request("/auth/login", None, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(response.headers()["x-internal"], "leak");
    }

    #[tokio::test]
    async fn test_query_string_ignored_for_matching() {
        let app = router(harness(false, false).gate);
        let response = app
            .oneshot(request("/?next=/admin", Some("u1"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/accueil");
    }

    #[tokio::test]
    async fn test_dot_segments_rejected_before_evaluation() {
        for (maintenance, gate, path) in [
            (false, false, "/auth/../admin/users"),
            (false, true, "/gate/../accueil"),
            (true, false, "/maintenance/../admin/x"),
            (false, false, "/auth/%2e%2e/admin/users"),
        ] {
            let h = harness(maintenance, gate);
            let app = router(h.gate);
            let response = app.oneshot(request(path, None, None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{path}");
            let text = h.metrics.encode().unwrap();
            assert!(!text.contains("sitegate_decisions_total{"), "{path}: {text}");
        }
    }

    #[tokio::test]
    async fn test_doubled_slashes_collapsed_before_evaluation() {
        let app = router(harness(false, false).gate);
        let response = app
            .oneshot(request("//admin//users?tab=2", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/");

        let app = router(harness(false, false).gate);
        let response = app
            .oneshot(request("//auth//login/?next=1", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-seen-uri"], "/auth/login/?next=1");
    }
}
