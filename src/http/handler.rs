//! Main axum router and the handlers that live in the gate itself.
//!
//! Routes:
//! - `GET  /healthz`            - Health check (ungated)
//! - `GET  /metrics`            - Prometheus metrics (ungated)
//! - `POST {gate}/pass`         - Exchange the access code for a gate pass
//! - `ANY  /api-proxy/{*path}`  - Backend REST passthrough
//! - fallback                   - Upstream application proxy

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Form, FromRequest, Request, State},
    http::{header, StatusCode},
    middleware,
    response::{AppendHeaders, IntoResponse, Redirect, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::gate::middleware::gate_middleware;
use crate::gate::paths::BACKEND_PROXY_PREFIX;
use crate::gate::pass::access_code_matches;
use crate::AppState;

use super::proxy;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let pass_route = format!("{}/pass", state.config.paths.gate.trim_end_matches('/'));
    let backend_route = format!("{BACKEND_PROXY_PREFIX}/{{*path}}");

    let gated = Router::new()
        .route(&pass_route, post(handle_gate_pass))
        .route(&backend_route, any(proxy::forward_to_backend))
        .fallback(proxy::forward_to_app)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.gate),
            gate_middleware,
        ));

    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .merge(gated)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PassRequest {
    #[serde(default)]
    code: String,
}

/// `POST {gate}/pass`
///
/// Accepts a form or JSON body with `code`.  A matching code sets the gate
/// pass cookie and sends the caller to the root page; anything else goes
/// back to the gate page with `?error=1`.
async fn handle_gate_pass(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, AppError> {
    let paths = state.gate.paths();
    let failure = format!("{}?error=1", paths.gate());

    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    let submitted = if is_json {
        Json::<PassRequest>::from_request(request, &state)
            .await
            .ok()
            .map(|Json(body)| body.code)
    } else {
        Form::<PassRequest>::from_request(request, &state)
            .await
            .ok()
            .map(|Form(body)| body.code)
    };

    let accepted = match (state.access_code.as_deref(), submitted.as_deref()) {
        (Some(expected), Some(code)) => access_code_matches(expected, code),
        _ => false,
    };
    if !accepted {
        state.metrics.metrics.gate_pass_rejected_total.inc();
        warn!("gate pass refused");
        return Ok(Redirect::to(&failure).into_response());
    }

    let ttl = Duration::from_secs(state.config.gate.pass_ttl_secs);
    let pass = state.gate.issue_pass(ttl)?;
    let mut cookie = format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        state.gate.pass_cookie(),
        pass.encode()?,
        ttl.as_secs(),
    );
    if state.config.gate.cookie_secure {
        cookie.push_str("; Secure");
    }

    state.metrics.metrics.gate_pass_issued_total.inc();
    info!(exp = pass.exp, signed = pass.sig.is_some(), "gate pass issued");

    Ok((
        AppendHeaders([(header::SET_COOKIE, cookie)]),
        Redirect::to(paths.root()),
    )
        .into_response())
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let keys = &state.config.settings;
    let health_state = crate::health::HealthState {
        gate: Arc::clone(&state.gate),
        settings: Arc::clone(&state.settings),
        probe_keys: vec![keys.maintenance_key.clone(), keys.gate_key.clone()],
        http_client: state.http_client.clone(),
        app_url: state.config.upstream.app_url.clone(),
        timeout: Duration::from_millis(state.config.backend.timeout_ms),
    };
    crate::health::health_handler(State(health_state)).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the gate.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// An upstream (app or backend) could not be reached.
    BadGateway(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadGateway(msg) => {
                warn!(error = %msg, "upstream unavailable");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(serde_json::json!({ "error": msg })),
                )
                    .into_response()
            }
            AppError::Internal(err) => {
                error!(error = ?err, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
