//! Combines the route tables of every module into one router.

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::core::shared::state::AppState;
use crate::core::urls::ApiUrls;

pub fn configure_api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(ApiUrls::HEALTH, get(health))
        .merge(crate::billing::configure_billing_api_routes())
        .merge(crate::calendar::configure_calendar_routes())
        .merge(crate::attribution::api::configure_attribution_routes())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION") }))
}
