use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::attribution::{self, AdvanceOutcome, AttributionRecord, FunnelLinks, FunnelStage, FunnelSubject};
use crate::core::context::CallerContext;
use crate::core::error::CoreResult;
use crate::core::shared::state::AppState;
use crate::core::urls::ApiUrls;

#[derive(Debug, Deserialize)]
pub struct RecordCallRequest {
    pub call_id: String,
    pub customer_id: Option<String>,
    pub estimated_value: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AdvanceRequest {
    pub subject: FunnelSubject,
    pub stage: FunnelStage,
    pub value: Option<i64>,
    #[serde(default)]
    pub links: FunnelLinks,
}

#[derive(Debug, Deserialize)]
pub struct LostRequest {
    pub subject: FunnelSubject,
}

pub async fn record_call(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Json(req): Json<RecordCallRequest>,
) -> CoreResult<(StatusCode, Json<AttributionRecord>)> {
    let record = state
        .blocking(move |conn| {
            attribution::record_call(conn, &ctx.tenant_id, &req.call_id, req.customer_id, req.estimated_value)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn advance(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Json(req): Json<AdvanceRequest>,
) -> CoreResult<Json<AdvanceOutcome>> {
    let outcome = state
        .blocking(move |conn| {
            attribution::advance_stage(conn, &ctx.tenant_id, &req.subject, req.stage, req.value, &req.links)
        })
        .await?;
    Ok(Json(outcome))
}

pub async fn mark_lost(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Json(req): Json<LostRequest>,
) -> CoreResult<Json<AdvanceOutcome>> {
    let outcome = state
        .blocking(move |conn| attribution::mark_lost(conn, &ctx.tenant_id, &req.subject))
        .await?;
    Ok(Json(outcome))
}

pub async fn get_record(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
) -> CoreResult<Json<AttributionRecord>> {
    let record = state
        .blocking(move |conn| attribution::get_record(conn, &ctx.tenant_id, &id))
        .await?;
    Ok(Json(record))
}

pub fn configure_attribution_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(ApiUrls::ATTRIBUTION_CALLS, post(record_call))
        .route(ApiUrls::ATTRIBUTION_ADVANCE, post(advance))
        .route(ApiUrls::ATTRIBUTION_LOST, post(mark_lost))
        .route(ApiUrls::ATTRIBUTION_BY_ID, get(get_record))
}
