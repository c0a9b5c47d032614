use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::calendar::scheduler::{
    self, Appointment, AppointmentAction, Availability, AvailabilityQuery, CreateAppointmentInput, RescheduleInput,
};
use crate::core::context::CallerContext;
use crate::core::error::CoreResult;
use crate::core::shared::state::AppState;
use crate::core::urls::ApiUrls;

#[derive(Debug, Deserialize)]
pub struct StatusChangeRequest {
    pub action: AppointmentAction,
}

pub async fn check_availability(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Query(query): Query<AvailabilityQuery>,
) -> CoreResult<Json<Availability>> {
    let step = i64::from(state.config.scheduling.slot_step_minutes);
    let availability = state
        .blocking(move |conn| scheduler::check_availability(conn, &ctx, &query, step))
        .await?;
    Ok(Json(availability))
}

pub async fn create_appointment(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Json(input): Json<CreateAppointmentInput>,
) -> CoreResult<(StatusCode, Json<Appointment>)> {
    let committed = state
        .blocking(move |conn| scheduler::create_appointment(conn, &ctx, input))
        .await?;
    Ok((StatusCode::CREATED, Json(state.effects.complete(committed).await)))
}

pub async fn get_appointment(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
) -> CoreResult<Json<Appointment>> {
    let appointment = state
        .blocking(move |conn| scheduler::get_appointment(conn, &ctx, &id))
        .await?;
    Ok(Json(appointment))
}

pub async fn reschedule_appointment(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
    Json(input): Json<RescheduleInput>,
) -> CoreResult<Json<Appointment>> {
    let committed = state
        .blocking(move |conn| scheduler::reschedule_appointment(conn, &ctx, &id, input))
        .await?;
    Ok(Json(state.effects.complete(committed).await))
}

pub async fn update_appointment_status(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
    Json(req): Json<StatusChangeRequest>,
) -> CoreResult<Json<Appointment>> {
    let committed = state
        .blocking(move |conn| scheduler::update_status(conn, &ctx, &id, req.action))
        .await?;
    Ok(Json(state.effects.complete(committed).await))
}

pub fn configure_calendar_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(ApiUrls::AVAILABILITY, get(check_availability))
        .route(ApiUrls::APPOINTMENTS, post(create_appointment))
        .route(ApiUrls::APPOINTMENT_BY_ID, get(get_appointment))
        .route(ApiUrls::APPOINTMENT_RESCHEDULE, post(reschedule_appointment))
        .route(ApiUrls::APPOINTMENT_STATUS, post(update_appointment_status))
}
