use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::billing::estimates::{self, CreateEstimateInput, DepositInput, UpdateEstimateInput};
use crate::billing::invoices::{self, CreateInvoiceInput, ManualPaymentInput, PaymentIntentResponse};
use crate::billing::models::{Conversion, DepositRequest, Estimate, EstimateDetail, Invoice, InvoiceDetail, Payment, PaymentApplied};
use crate::billing::webhooks::ReconcileOutcome;
use crate::core::context::CallerContext;
use crate::core::error::{CoreError, CoreResult};
use crate::core::shared::state::AppState;
use crate::core::urls::ApiUrls;

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";
const DEFAULT_CURRENCY: &str = "usd";

#[derive(Debug, Default, Deserialize)]
pub struct PaymentIntentBody {
    pub currency: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: ReconcileOutcome,
}

pub async fn create_estimate(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Json(input): Json<CreateEstimateInput>,
) -> CoreResult<(StatusCode, Json<EstimateDetail>)> {
    let detail = state
        .blocking(move |conn| estimates::create_estimate(conn, &ctx, input))
        .await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

pub async fn get_estimate(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
) -> CoreResult<Json<EstimateDetail>> {
    let detail = state
        .blocking(move |conn| estimates::get_estimate(conn, &ctx, &id))
        .await?;
    Ok(Json(detail))
}

pub async fn update_estimate(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
    Json(input): Json<UpdateEstimateInput>,
) -> CoreResult<Json<EstimateDetail>> {
    let detail = state
        .blocking(move |conn| estimates::update_estimate(conn, &ctx, &id, input))
        .await?;
    Ok(Json(detail))
}

pub async fn send_estimate(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
) -> CoreResult<Json<Estimate>> {
    let committed = state
        .blocking(move |conn| estimates::send_estimate(conn, &ctx, &id))
        .await?;
    Ok(Json(state.effects.complete(committed).await))
}

pub async fn approve_estimate(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
) -> CoreResult<Json<Estimate>> {
    let committed = state
        .blocking(move |conn| estimates::approve_estimate(conn, &ctx, &id))
        .await?;
    Ok(Json(state.effects.complete(committed).await))
}

pub async fn decline_estimate(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
) -> CoreResult<Json<Estimate>> {
    let estimate = state
        .blocking(move |conn| estimates::decline_estimate(conn, &ctx, &id))
        .await?;
    Ok(Json(estimate))
}

pub async fn void_estimate(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
) -> CoreResult<Json<Estimate>> {
    let estimate = state
        .blocking(move |conn| estimates::void_estimate(conn, &ctx, &id))
        .await?;
    Ok(Json(estimate))
}

pub async fn convert_estimate(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
) -> CoreResult<(StatusCode, Json<Conversion>)> {
    let conversion = state
        .blocking(move |conn| estimates::convert_to_invoice(conn, &ctx, &id))
        .await?;
    Ok((StatusCode::CREATED, Json(conversion)))
}

pub async fn request_deposit(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
    Json(input): Json<DepositInput>,
) -> CoreResult<(StatusCode, Json<DepositRequest>)> {
    let default_percent = state.config.billing.default_deposit_percent;
    let request = state
        .blocking(move |conn| estimates::request_deposit(conn, &ctx, &id, input, default_percent))
        .await?;
    Ok((StatusCode::CREATED, Json(request)))
}

pub async fn create_invoice(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Json(input): Json<CreateInvoiceInput>,
) -> CoreResult<(StatusCode, Json<InvoiceDetail>)> {
    let detail = state
        .blocking(move |conn| invoices::create_invoice(conn, &ctx, input))
        .await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

pub async fn get_invoice(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
) -> CoreResult<Json<InvoiceDetail>> {
    let detail = state
        .blocking(move |conn| invoices::get_invoice(conn, &ctx, &id))
        .await?;
    Ok(Json(detail))
}

pub async fn send_invoice(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
) -> CoreResult<Json<Invoice>> {
    let committed = state
        .blocking(move |conn| invoices::send_invoice(conn, &ctx, &id))
        .await?;
    Ok(Json(state.effects.complete(committed).await))
}

pub async fn void_invoice(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
) -> CoreResult<Json<Invoice>> {
    let invoice = state
        .blocking(move |conn| invoices::void_invoice(conn, &ctx, &id))
        .await?;
    Ok(Json(invoice))
}

pub async fn mark_invoice_viewed(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
) -> CoreResult<Json<Invoice>> {
    let invoice = state
        .blocking(move |conn| invoices::mark_invoice_viewed(conn, &ctx, &id))
        .await?;
    Ok(Json(invoice))
}

pub async fn mark_invoice_overdue(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
) -> CoreResult<Json<Invoice>> {
    let invoice = state
        .blocking(move |conn| invoices::mark_invoice_overdue(conn, &ctx, &id))
        .await?;
    Ok(Json(invoice))
}

pub async fn list_payments(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
) -> CoreResult<Json<Vec<Payment>>> {
    let payments = state
        .blocking(move |conn| invoices::list_payments(conn, &ctx, &id))
        .await?;
    Ok(Json(payments))
}

pub async fn record_payment(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
    Json(input): Json<ManualPaymentInput>,
) -> CoreResult<(StatusCode, Json<PaymentApplied>)> {
    let committed = state
        .blocking(move |conn| invoices::record_manual_payment(conn, &ctx, &id, input))
        .await?;
    Ok((StatusCode::CREATED, Json(state.effects.complete(committed).await)))
}

pub async fn create_payment_intent(
    State(state): State<Arc<AppState>>,
    ctx: CallerContext,
    Path(id): Path<String>,
    Json(body): Json<PaymentIntentBody>,
) -> CoreResult<Json<PaymentIntentResponse>> {
    let processor = state.payment_processor()?;
    let currency = body.currency.as_deref().unwrap_or(DEFAULT_CURRENCY);
    let response = invoices::create_payment_intent(&state.conn, processor, &ctx, &id, currency).await?;
    Ok(Json(response))
}

/// Provider deliveries. Only a bad signature or malformed payload is
/// rejected; everything else is acknowledged so the provider stops retrying.
pub async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> CoreResult<Json<WebhookAck>> {
    let stripe = state
        .stripe
        .as_deref()
        .ok_or_else(|| CoreError::External("payment provider webhooks are not configured".to_string()))?;
    let signature = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| CoreError::Validation(format!("missing {STRIPE_SIGNATURE_HEADER} header")))?;

    let outcome = state.webhooks.handle_delivery(stripe, &body, signature).await?;
    Ok(Json(WebhookAck {
        received: true,
        outcome,
    }))
}

pub fn configure_billing_api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(ApiUrls::ESTIMATES, post(create_estimate))
        .route(ApiUrls::ESTIMATE_BY_ID, get(get_estimate).put(update_estimate))
        .route(ApiUrls::ESTIMATE_SEND, post(send_estimate))
        .route(ApiUrls::ESTIMATE_APPROVE, post(approve_estimate))
        .route(ApiUrls::ESTIMATE_DECLINE, post(decline_estimate))
        .route(ApiUrls::ESTIMATE_VOID, post(void_estimate))
        .route(ApiUrls::ESTIMATE_CONVERT, post(convert_estimate))
        .route(ApiUrls::ESTIMATE_DEPOSIT, post(request_deposit))
        .route(ApiUrls::INVOICES, post(create_invoice))
        .route(ApiUrls::INVOICE_BY_ID, get(get_invoice))
        .route(ApiUrls::INVOICE_SEND, post(send_invoice))
        .route(ApiUrls::INVOICE_VOID, post(void_invoice))
        .route(ApiUrls::INVOICE_VIEWED, post(mark_invoice_viewed))
        .route(ApiUrls::INVOICE_OVERDUE, post(mark_invoice_overdue))
        .route(ApiUrls::INVOICE_PAYMENTS, get(list_payments).post(record_payment))
        .route(ApiUrls::INVOICE_PAYMENT_INTENT, post(create_payment_intent))
        .route(ApiUrls::STRIPE_WEBHOOK, post(stripe_webhook))
}
