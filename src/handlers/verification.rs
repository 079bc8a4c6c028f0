//! Verification API: create a run, execute it, read the report back.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::db::AppState;
use crate::error::{AppError, Result};
use crate::models::VerificationRun;
use crate::rate_limit;
use crate::verification::{self, RevenueSummary};

pub fn router(rate_limit_rpm: u32) -> Router<AppState> {
    Router::new()
        .route("/verification/runs", post(create_run))
        .route("/verification/runs/{run_id}", get(get_run))
        .route("/verification/runs/{run_id}/start", post(start_run))
        .route("/verification/revenue", get(revenue))
        .layer(rate_limit::verification_layer(rate_limit_rpm))
}

async fn create_run(
    State(state): State<AppState>,
    Json(input): Json<crate::models::CreateVerificationRun>,
) -> Result<Json<VerificationRun>> {
    if input.platforms.is_empty() {
        return Err(AppError::BadRequest("at least one platform is required".into()));
    }

    let conn = state.db.get()?;
    let run = verification::create_run(&conn, &input)?;

    tracing::info!(
        run_id = %run.id,
        tenant_id = %run.tenant_id,
        window_start = run.window_start,
        window_end = run.window_end,
        "verification run created"
    );

    Ok(Json(run))
}

async fn start_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<VerificationRun>> {
    let conn = state.db.get()?;
    let run = verification::start_run(&conn, &run_id)?;
    Ok(Json(run))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<VerificationRun>> {
    let conn = state.db.get()?;
    let run = crate::db::queries::get_verification_run(&conn, &run_id)?
        .ok_or_else(|| AppError::NotFound(format!("verification run {}", run_id)))?;
    Ok(Json(run))
}

#[derive(Debug, Deserialize)]
struct RevenueQuery {
    tenant_id: String,
    window_start: i64,
    window_end: i64,
}

async fn revenue(
    State(state): State<AppState>,
    Query(q): Query<RevenueQuery>,
) -> Result<Json<RevenueSummary>> {
    if q.window_end <= q.window_start {
        return Err(AppError::BadRequest("window_end must be after window_start".into()));
    }

    let conn = state.db.get()?;
    crate::db::queries::get_tenant_by_id(&conn, &q.tenant_id)?
        .ok_or_else(|| AppError::NotFound("unknown tenant".into()))?;

    let summary = verification::revenue_report(&conn, &q.tenant_id, q.window_start, q.window_end)?;
    Ok(Json(summary))
}
