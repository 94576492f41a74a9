use std::time::Instant;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::controller::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    uptime_secs: i64,
    sites: usize,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    store: ComponentHealth,
    anchor: ComponentHealth,
}

#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ComponentHealth {
    fn healthy(latency_ms: u64) -> Self {
        Self {
            status: "healthy".to_string(),
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    fn unhealthy(error: String) -> Self {
        Self {
            status: "unhealthy".to_string(),
            latency_ms: None,
            error: Some(error),
        }
    }

    fn disabled() -> Self {
        Self {
            status: "disabled".to_string(),
            latency_ms: None,
            error: None,
        }
    }

    fn is_healthy(&self) -> bool {
        self.status != "unhealthy"
    }
}

/// GET /healthz - liveness
pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

/// GET /health - store and attestation service status
///
/// An unreachable store is a 503. An unreachable attestation service only
/// degrades the status, since anchoring is best-effort.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let start = Instant::now();
    let store = match state.pipeline.store().ping().await {
        Ok(()) => ComponentHealth::healthy(start.elapsed().as_millis() as u64),
        Err(e) => ComponentHealth::unhealthy(format!("{e:#}")),
    };

    let start = Instant::now();
    let anchor = match state.pipeline.anchor_status().await {
        None => ComponentHealth::disabled(),
        Some(s) if s.reachable => ComponentHealth::healthy(start.elapsed().as_millis() as u64),
        Some(s) => ComponentHealth::unhealthy(s.error.unwrap_or_default()),
    };

    let status = match (store.is_healthy(), anchor.is_healthy()) {
        (true, true) => "healthy",
        _ => "degraded",
    };
    let status_code = if store.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: status.to_string(),
        timestamp: chrono::Utc::now(),
        uptime_secs: (chrono::Utc::now() - state.started_at).num_seconds(),
        sites: state.pipeline.sites().count(),
        checks: HealthChecks { store, anchor },
    };
    tracing::debug!(status, "health check completed");
    (status_code, Json(response))
}
