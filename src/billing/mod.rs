//! Estimates, invoices, payments and payment-provider reconciliation.

pub mod api;
pub mod estimates;
pub mod invoices;
pub mod models;
pub mod sequence;
pub mod status;
pub mod stripe_integration;
pub mod totals;
pub mod webhooks;

pub use api::configure_billing_api_routes;
pub use models::{Conversion, DepositRequest, Estimate, EstimateDetail, Invoice, InvoiceDetail, Payment, PaymentApplied};
pub use status::{EstimateStatus, InvoiceStatus, PaymentMethod, PaymentStatus};
pub use webhooks::{ReconcileOutcome, WebhookReconciler};
