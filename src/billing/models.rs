use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::billing::status::{EstimateStatus, InvoiceStatus};
use crate::core::error::CoreResult;
use crate::core::lifecycle::parse_stored;
use crate::core::shared::schema::{
    estimate_line_items, estimates, invoice_line_items, invoices, payments, provider_subscriptions,
    webhook_events,
};

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, Identifiable)]
#[diesel(table_name = estimates)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Estimate {
    pub id: String,
    pub tenant_id: String,
    pub customer_id: String,
    pub job_id: Option<String>,
    pub estimate_number: String,
    pub status: String,
    pub tax_rate_bps: i32,
    pub subtotal: i64,
    pub tax_amount: i64,
    pub total: i64,
    pub notes: Option<String>,
    pub deposit_requested: bool,
    pub deposit_invoice_id: Option<String>,
    pub deposit_requested_at: Option<NaiveDateTime>,
    pub converted_invoice_id: Option<String>,
    pub sent_at: Option<NaiveDateTime>,
    pub approved_at: Option<NaiveDateTime>,
    pub declined_at: Option<NaiveDateTime>,
    pub voided_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Estimate {
    pub fn status(&self) -> CoreResult<EstimateStatus> {
        parse_stored(&self.status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = estimate_line_items)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EstimateLineItem {
    pub id: String,
    pub estimate_id: String,
    pub tenant_id: String,
    pub description: String,
    pub quantity: f64,
    pub unit_price: i64,
    pub line_total: i64,
    pub sort_order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, Identifiable)]
#[diesel(table_name = invoices)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Invoice {
    pub id: String,
    pub tenant_id: String,
    pub customer_id: String,
    pub job_id: Option<String>,
    pub estimate_id: Option<String>,
    pub invoice_number: String,
    pub status: String,
    pub tax_rate_bps: i32,
    pub subtotal: i64,
    pub tax_amount: i64,
    pub total: i64,
    pub paid_amount: i64,
    pub is_deposit: bool,
    pub payment_intent_id: Option<String>,
    pub notes: Option<String>,
    pub sent_at: Option<NaiveDateTime>,
    pub paid_at: Option<NaiveDateTime>,
    pub voided_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Invoice {
    pub fn status(&self) -> CoreResult<InvoiceStatus> {
        parse_stored(&self.status)
    }

    pub fn balance_due(&self) -> i64 {
        (self.total - self.paid_amount).max(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = invoice_line_items)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct InvoiceLineItem {
    pub id: String,
    pub invoice_id: String,
    pub tenant_id: String,
    pub description: String,
    pub quantity: f64,
    pub unit_price: i64,
    pub line_total: i64,
    pub sort_order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = payments)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Payment {
    pub id: String,
    pub tenant_id: String,
    pub invoice_id: String,
    pub customer_id: String,
    pub amount: i64,
    pub method: String,
    pub status: String,
    pub payment_intent_id: Option<String>,
    pub note: Option<String>,
    pub processed_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = provider_subscriptions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ProviderSubscription {
    pub id: String,
    pub tenant_id: String,
    pub provider_subscription_id: String,
    pub status: String,
    pub current_period_end: Option<NaiveDateTime>,
    pub last_event_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = webhook_events)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub subject_id: Option<String>,
    pub event_created_at: NaiveDateTime,
    pub outcome: String,
    pub processed_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct EstimateDetail {
    #[serde(flatten)]
    pub estimate: Estimate,
    pub line_items: Vec<EstimateLineItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDetail {
    #[serde(flatten)]
    pub invoice: Invoice,
    pub line_items: Vec<InvoiceLineItem>,
}

/// Result of converting an approved estimate.
#[derive(Debug, Clone, Serialize)]
pub struct Conversion {
    pub estimate: Estimate,
    pub invoice: InvoiceDetail,
}

/// Result of requesting a deposit on an approved estimate.
#[derive(Debug, Clone, Serialize)]
pub struct DepositRequest {
    pub estimate: Estimate,
    pub deposit_invoice: InvoiceDetail,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentApplied {
    pub payment: Payment,
    pub invoice: Invoice,
}
