use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::backend::SettingsStore;
use crate::gate::cache::SiteMode;
use crate::gate::RequestGate;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
    pub site_mode: SiteModeReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub app: CheckResult,
    pub backend: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

/// Cached flags as the gate currently sees them.
#[derive(Debug, Serialize)]
pub struct SiteModeReport {
    pub mode: SiteMode,
    pub maintenance: bool,
    pub gate: bool,
    /// Milliseconds since the last refresh; absent before the first request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_ms: Option<i64>,
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// Subset of `AppState` the health handler needs.
#[derive(Clone)]
pub struct HealthState {
    pub gate: Arc<RequestGate>,
    pub settings: Arc<dyn SettingsStore>,
    pub probe_keys: Vec<String>,
    pub http_client: reqwest::Client,
    pub app_url: String,
    pub timeout: Duration,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_backend(store: &dyn SettingsStore, keys: &[String], timeout: Duration) -> CheckResult {
    let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
    match tokio::time::timeout(timeout, store.get_many(&keys)).await {
        Ok(Ok(_)) => CheckResult::healthy(),
        Ok(Err(e)) => CheckResult::unhealthy(format!("settings read failed: {e:#}")),
        Err(_) => CheckResult::unhealthy(format!(
            "settings read timed out after {}ms",
            timeout.as_millis()
        )),
    }
}

async fn check_app(client: &reqwest::Client, app_url: &str, timeout: Duration) -> CheckResult {
    match client.head(app_url).timeout(timeout).send().await {
        // Any HTTP answer means the origin is up.
        Ok(resp) if !resp.status().is_server_error() => CheckResult::healthy(),
        Ok(resp) => CheckResult::unhealthy(format!("HEAD {app_url} returned {}", resp.status())),
        Err(e) => CheckResult::unhealthy(format!("HEAD {app_url} failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

/// The app origin is required; the backend is not, because the gate fails
/// open when settings cannot be read.
fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.app.ok {
        HealthStatus::Unhealthy
    } else if !checks.backend.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let (app, backend) = tokio::join!(
        check_app(&state.http_client, &state.app_url, state.timeout),
        check_backend(state.settings.as_ref(), &state.probe_keys, state.timeout),
    );

    let checks = HealthChecks { app, backend };
    let status = aggregate_status(&checks);

    let snapshot = state.gate.settings_snapshot();
    let now = state.gate.now_ms();
    let site_mode = SiteModeReport {
        mode: snapshot.mode(),
        maintenance: snapshot.maintenance_enabled,
        gate: snapshot.gate_enabled,
        age_ms: snapshot.last_refreshed_at.map(|at| now - at),
    };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (
        http_status,
        Json(HealthResponse {
            status,
            checks,
            site_mode,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checks(app: bool, backend: bool) -> HealthChecks {
        let r = |ok| if ok { CheckResult::healthy() } else { CheckResult::unhealthy("x") };
        HealthChecks {
            app: r(app),
            backend: r(backend),
        }
    }

    #[test]
    fn test_aggregate_status() {
        assert_eq!(aggregate_status(&checks(true, true)), HealthStatus::Ok);
        assert_eq!(aggregate_status(&checks(true, false)), HealthStatus::Degraded);
        assert_eq!(aggregate_status(&checks(false, true)), HealthStatus::Unhealthy);
        assert_eq!(aggregate_status(&checks(false, false)), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_check_result_serialisation() {
        let json = serde_json::to_value(CheckResult::healthy()).unwrap();
        assert_eq!(json, serde_json::json!({"ok": true}));
        let json = serde_json::to_value(CheckResult::unhealthy("down")).unwrap();
        assert_eq!(json, serde_json::json!({"ok": false, "detail": "down"}));
    }
}
