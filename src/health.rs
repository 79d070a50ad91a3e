use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::Gateway;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub atc: CheckResult,
    pub listener: CheckResult,
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

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

async fn check_atc(client: &reqwest::Client, endpoint: &str) -> CheckResult {
    let url = format!("{}/api/v1/info", endpoint.trim_end_matches('/'));
    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => CheckResult::healthy(),
        Ok(resp) => CheckResult::unhealthy(format!("GET {} returned {}", url, resp.status())),
        Err(e) => CheckResult::unhealthy(format!("GET {url} failed: {e}")),
    }
}

fn check_listener(state: &Gateway) -> CheckResult {
    if state.ssh_listener_up.load(Ordering::SeqCst) {
        CheckResult::healthy()
    } else {
        CheckResult::unhealthy("SSH listener is not accepting connections")
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz`.  Returns 200 when the SSH listener is accepting and the
/// orchestrator is reachable, 503 otherwise.
pub async fn health_handler(State(state): State<Arc<Gateway>>) -> impl IntoResponse {
    let atc = check_atc(&state.http_client, &state.config.atc.endpoint).await;
    let listener = check_listener(&state);

    let status = if atc.ok && listener.ok {
        HealthStatus::Ok
    } else {
        HealthStatus::Degraded
    };

    let body = HealthResponse {
        status,
        checks: HealthChecks { atc, listener },
    };

    let http_status = if status == HealthStatus::Ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (http_status, Json(body))
}
