use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::health::{health_check, healthz};
use crate::controller::AppState;

type SiteDay = Path<(String, NaiveDate)>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/health", get(health_check))
        .route("/sites", get(list_sites))
        .route("/sites/:site_id/backfill", post(backfill))
        .route("/sites/:site_id/days/:day/generate", post(generate_day))
        .route("/sites/:site_id/days/:day/hourly", get(get_hourly))
        .route("/sites/:site_id/days/:day/digest", get(get_digest))
        .route("/sites/:site_id/days/:day/digest.csv", get(get_digest_csv))
        .route("/sites/:site_id/days/:day/verify", get(verify_day))
        .route("/sites/:site_id/days/:day/anchor", post(anchor_day))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct SiteSummary {
    pub id: String,
    pub name: String,
    pub capacity_ac_kw: f64,
    pub capacity_dc_kw: f64,
    pub outage_windows: usize,
}

pub async fn list_sites(State(st): State<AppState>) -> impl IntoResponse {
    let sites: Vec<SiteSummary> = st
        .pipeline
        .sites()
        .map(|s| SiteSummary {
            id: s.id.clone(),
            name: s.display_name().to_string(),
            capacity_ac_kw: s.capacity_ac_kw,
            capacity_dc_kw: s.capacity_dc_kw,
            outage_windows: s.outage_windows.len(),
        })
        .collect();
    Json(sites)
}

/// Generate, aggregate, digest and export one site-day. Never anchors.
pub async fn generate_day(
    State(st): State<AppState>,
    Path((site_id, day)): SiteDay,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = st
        .pipeline
        .process_day(&site_id, day, false, &st.shutdown)
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

pub async fn get_hourly(
    State(st): State<AppState>,
    Path((site_id, day)): SiteDay,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(st.pipeline.hourly(&site_id, day).await?))
}

pub async fn get_digest(
    State(st): State<AppState>,
    Path((site_id, day)): SiteDay,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(st.pipeline.artifact(&site_id, day).await?))
}

pub async fn get_digest_csv(
    State(st): State<AppState>,
    Path((site_id, day)): SiteDay,
) -> Result<impl IntoResponse, ApiError> {
    let body = st.pipeline.csv(&site_id, day).await?;
    Ok(([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], body))
}

/// 200 when the stored rows still match the digest, 409 otherwise. The
/// report is returned either way.
pub async fn verify_day(
    State(st): State<AppState>,
    Path((site_id, day)): SiteDay,
) -> Result<impl IntoResponse, ApiError> {
    let report = st.pipeline.verify_day(&site_id, day).await?;
    let status = if report.is_valid() {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(report)))
}

/// 200 on success, 502 when every attempt failed.
pub async fn anchor_day(
    State(st): State<AppState>,
    Path((site_id, day)): SiteDay,
) -> Result<impl IntoResponse, ApiError> {
    let cancel = st.shutdown.child_token();
    let report = st.pipeline.anchor_day(&site_id, day, &cancel).await?;
    let status = if report.is_success() {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    Ok((status, Json(report)))
}

#[derive(Debug, Deserialize)]
pub struct BackfillRequest {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

pub async fn backfill(
    State(st): State<AppState>,
    Path(site_id): Path<String>,
    Json(req): Json<BackfillRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcomes = st
        .pipeline
        .backfill(&site_id, req.from, req.to, &st.shutdown)
        .await?;
    Ok(Json(outcomes))
}
