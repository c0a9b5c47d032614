//! Applies payment-provider events to invoices and payments at most once.
//!
//! Every handled event id lands in `webhook_events` together with its
//! outcome, so a redelivery short-circuits before any other lookup. Payment
//! events are additionally keyed on the payment-intent id through the partial
//! unique index on succeeded payments. Subscription events carry state that
//! can move back and forth, so they are ordered by the provider's event time
//! and anything older than the last applied event is dropped.

use chrono::{DateTime, NaiveDateTime};
use diesel::prelude::*;
use diesel::SqliteConnection;
use serde::Serialize;

use crate::billing::invoices::{accumulate_payment, insert_payment, payment_effects, NewPayment};
use crate::billing::models::{Invoice, PaymentApplied, ProviderSubscription, WebhookEventRecord};
use crate::billing::status::{InvoiceStatus, PaymentMethod, PaymentStatus};
use crate::billing::stripe_integration::{
    parse_webhook_event, StripeClient, StripePaymentIntent, StripeSubscription, StripeWebhookEvent,
    WebhookEventType,
};
use crate::core::effects::{Committed, EffectRunner};
use crate::core::error::{CoreError, CoreResult};
use crate::core::shared::schema::{invoices, payments, provider_subscriptions, webhook_events};
use crate::core::shared::utils::{new_id, now_utc, with_retry, DbPool};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied,
    Duplicate,
    Stale,
    Discarded,
    Ignored,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::Stale => "stale",
            Self::Discarded => "discarded",
            Self::Ignored => "ignored",
        }
    }
}

fn event_time(event: &StripeWebhookEvent) -> CoreResult<NaiveDateTime> {
    DateTime::from_timestamp(event.created, 0)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| CoreError::Validation(format!("event {} has an invalid timestamp", event.id)))
}

fn already_processed(conn: &mut SqliteConnection, event_id: &str) -> CoreResult<bool> {
    let found: Option<String> = webhook_events::table
        .filter(webhook_events::event_id.eq(event_id))
        .select(webhook_events::event_id)
        .first(conn)
        .optional()?;
    Ok(found.is_some())
}

fn record_event(
    conn: &mut SqliteConnection,
    event: &StripeWebhookEvent,
    subject_id: Option<&str>,
    outcome: ReconcileOutcome,
) -> CoreResult<ReconcileOutcome> {
    let record = WebhookEventRecord {
        event_id: event.id.clone(),
        event_type: event.event_type.clone(),
        subject_id: subject_id.map(str::to_string),
        event_created_at: event_time(event)?,
        outcome: outcome.as_str().to_string(),
        processed_at: now_utc(),
    };
    diesel::insert_into(webhook_events::table)
        .values(&record)
        .execute(conn)?;

    tracing::info!(
        event_id = %event.id,
        event_type = %event.event_type,
        subject_id = subject_id.unwrap_or("-"),
        outcome = outcome.as_str(),
        "Webhook event recorded"
    );
    Ok(outcome)
}

/// Record an outcome in its own transaction unless the event is already known.
fn record_outcome(
    conn: &mut SqliteConnection,
    event: &StripeWebhookEvent,
    subject_id: Option<&str>,
    outcome: ReconcileOutcome,
) -> CoreResult<ReconcileOutcome> {
    with_retry("record_webhook_event", || {
        conn.immediate_transaction(|conn| {
            if already_processed(conn, &event.id)? {
                return Ok(ReconcileOutcome::Duplicate);
            }
            record_event(conn, event, subject_id, outcome)
        })
    })
}

/// Reconcile one verified event. The returned effects must only be run
/// after this call returns, i.e. after the commit.
pub fn reconcile_event(
    conn: &mut SqliteConnection,
    event: &StripeWebhookEvent,
) -> CoreResult<Committed<ReconcileOutcome>> {
    if already_processed(conn, &event.id)? {
        tracing::debug!(event_id = %event.id, "Duplicate webhook delivery");
        return Ok(Committed::new(ReconcileOutcome::Duplicate));
    }

    match parse_webhook_event(event)? {
        WebhookEventType::PaymentIntentSucceeded(intent) => apply_payment_succeeded(conn, event, &intent),
        WebhookEventType::PaymentIntentFailed(intent) => {
            apply_payment_failed(conn, event, &intent).map(Committed::new)
        }
        WebhookEventType::SubscriptionCreated(sub) | WebhookEventType::SubscriptionUpdated(sub) => {
            apply_subscription(conn, event, &sub, false).map(Committed::new)
        }
        WebhookEventType::SubscriptionDeleted(sub) => {
            apply_subscription(conn, event, &sub, true).map(Committed::new)
        }
        WebhookEventType::Unknown(event_type) => {
            tracing::debug!(event_id = %event.id, %event_type, "Unhandled webhook event type");
            record_outcome(conn, event, None, ReconcileOutcome::Ignored).map(Committed::new)
        }
    }
}

/// `(tenant_id, invoice_id)` from the intent metadata.
fn invoice_correlation(intent: &StripePaymentIntent) -> Option<(&str, &str)> {
    let tenant_id = intent.metadata.get("tenant_id")?;
    let invoice_id = intent.metadata.get("invoice_id")?;
    Some((tenant_id.as_str(), invoice_id.as_str()))
}

fn find_invoice(conn: &mut SqliteConnection, tenant_id: &str, invoice_id: &str) -> CoreResult<Option<Invoice>> {
    Ok(invoices::table
        .filter(invoices::tenant_id.eq(tenant_id))
        .filter(invoices::id.eq(invoice_id))
        .select(Invoice::as_select())
        .first(conn)
        .optional()?)
}

fn succeeded_payment_exists(conn: &mut SqliteConnection, tenant_id: &str, intent_id: &str) -> CoreResult<bool> {
    let found: Option<String> = payments::table
        .filter(payments::tenant_id.eq(tenant_id))
        .filter(payments::payment_intent_id.eq(intent_id))
        .filter(payments::status.eq(PaymentStatus::Succeeded.as_str()))
        .select(payments::id)
        .first(conn)
        .optional()?;
    Ok(found.is_some())
}

fn apply_payment_succeeded(
    conn: &mut SqliteConnection,
    event: &StripeWebhookEvent,
    intent: &StripePaymentIntent,
) -> CoreResult<Committed<ReconcileOutcome>> {
    let Some((tenant_id, invoice_id)) = invoice_correlation(intent) else {
        tracing::warn!(event_id = %event.id, intent_id = %intent.id, "Payment intent has no invoice metadata, discarding");
        return record_outcome(conn, event, Some(&intent.id), ReconcileOutcome::Discarded).map(Committed::new);
    };

    let amount = if intent.amount_received > 0 {
        intent.amount_received
    } else {
        intent.amount
    };

    with_retry("apply_payment_succeeded", || {
        conn.immediate_transaction(|conn| {
            if already_processed(conn, &event.id)? {
                return Ok(Committed::new(ReconcileOutcome::Duplicate));
            }
            if succeeded_payment_exists(conn, tenant_id, &intent.id)? {
                tracing::info!(event_id = %event.id, intent_id = %intent.id, "Payment already recorded for intent");
                return record_event(conn, event, Some(&intent.id), ReconcileOutcome::Duplicate).map(Committed::new);
            }

            let Some(invoice) = find_invoice(conn, tenant_id, invoice_id)? else {
                tracing::warn!(
                    event_id = %event.id,
                    tenant_id,
                    invoice_id,
                    intent_id = %intent.id,
                    "Invoice for payment intent not found, discarding"
                );
                return record_event(conn, event, Some(&intent.id), ReconcileOutcome::Discarded).map(Committed::new);
            };

            let status = invoice.status()?;
            let payment = insert_payment(
                conn,
                NewPayment {
                    invoice: &invoice,
                    amount,
                    method: PaymentMethod::Card,
                    status: PaymentStatus::Succeeded,
                    payment_intent_id: Some(intent.id.clone()),
                    note: Some(format!("provider event {}", event.id)),
                },
            )?;

            if status == InvoiceStatus::Void {
                // Money moved anyway; keep the payment row but leave the void invoice alone.
                tracing::warn!(
                    tenant_id,
                    invoice_id,
                    intent_id = %intent.id,
                    amount,
                    "Payment received for void invoice"
                );
                return record_event(conn, event, Some(&intent.id), ReconcileOutcome::Applied).map(Committed::new);
            }

            let was_paid = status == InvoiceStatus::Paid;
            let invoice = accumulate_payment(conn, &invoice, amount)?;
            record_event(conn, event, Some(&intent.id), ReconcileOutcome::Applied)?;

            tracing::info!(
                tenant_id,
                invoice_id,
                intent_id = %intent.id,
                amount,
                paid_amount = invoice.paid_amount,
                status = %invoice.status,
                "Payment applied from webhook"
            );

            let applied = PaymentApplied { payment, invoice };
            let effects = payment_effects(&applied, was_paid);
            Ok(Committed::new(ReconcileOutcome::Applied).with_all(effects))
        })
    })
}

fn apply_payment_failed(
    conn: &mut SqliteConnection,
    event: &StripeWebhookEvent,
    intent: &StripePaymentIntent,
) -> CoreResult<ReconcileOutcome> {
    let Some((tenant_id, invoice_id)) = invoice_correlation(intent) else {
        tracing::warn!(event_id = %event.id, intent_id = %intent.id, "Failed intent has no invoice metadata, discarding");
        return record_outcome(conn, event, Some(&intent.id), ReconcileOutcome::Discarded);
    };

    let reason = intent
        .last_payment_error
        .as_ref()
        .and_then(|e| e.message.clone().or_else(|| e.code.clone()))
        .unwrap_or_else(|| "payment failed".to_string());

    with_retry("apply_payment_failed", || {
        conn.immediate_transaction(|conn| {
            if already_processed(conn, &event.id)? {
                return Ok(ReconcileOutcome::Duplicate);
            }
            let Some(invoice) = find_invoice(conn, tenant_id, invoice_id)? else {
                tracing::warn!(event_id = %event.id, tenant_id, invoice_id, "Invoice for failed payment not found, discarding");
                return record_event(conn, event, Some(&intent.id), ReconcileOutcome::Discarded);
            };

            insert_payment(
                conn,
                NewPayment {
                    invoice: &invoice,
                    amount: intent.amount,
                    method: PaymentMethod::Card,
                    status: PaymentStatus::Failed,
                    payment_intent_id: Some(intent.id.clone()),
                    note: Some(reason.clone()),
                },
            )?;
            record_event(conn, event, Some(&intent.id), ReconcileOutcome::Applied)
        })
    })
}

fn find_subscription(
    conn: &mut SqliteConnection,
    provider_subscription_id: &str,
) -> CoreResult<Option<ProviderSubscription>> {
    Ok(provider_subscriptions::table
        .filter(provider_subscriptions::provider_subscription_id.eq(provider_subscription_id))
        .select(ProviderSubscription::as_select())
        .first(conn)
        .optional()?)
}

fn apply_subscription(
    conn: &mut SqliteConnection,
    event: &StripeWebhookEvent,
    sub: &StripeSubscription,
    deleted: bool,
) -> CoreResult<ReconcileOutcome> {
    let event_at = event_time(event)?;
    let status = if deleted { "canceled" } else { sub.status.as_str() };
    let period_end = sub
        .current_period_end
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .map(|dt| dt.naive_utc());

    with_retry("apply_subscription_event", || {
        conn.immediate_transaction(|conn| {
            if already_processed(conn, &event.id)? {
                return Ok(ReconcileOutcome::Duplicate);
            }

            let existing = find_subscription(conn, &sub.id)?;
            let tenant_id = match (&existing, sub.metadata.get("tenant_id")) {
                (Some(row), Some(claimed)) if &row.tenant_id != claimed => {
                    tracing::warn!(event_id = %event.id, subscription_id = %sub.id, "Subscription tenant mismatch, discarding");
                    return record_event(conn, event, Some(&sub.id), ReconcileOutcome::Discarded);
                }
                (Some(row), _) => row.tenant_id.clone(),
                (None, Some(claimed)) => claimed.clone(),
                (None, None) => {
                    tracing::warn!(event_id = %event.id, subscription_id = %sub.id, "Subscription has no tenant, discarding");
                    return record_event(conn, event, Some(&sub.id), ReconcileOutcome::Discarded);
                }
            };

            let now = now_utc();
            match existing {
                Some(row) if event_at < row.last_event_at => {
                    tracing::info!(
                        event_id = %event.id,
                        subscription_id = %sub.id,
                        event_at = %event_at,
                        last_applied_at = %row.last_event_at,
                        "Out-of-order subscription event, discarding"
                    );
                    return record_event(conn, event, Some(&sub.id), ReconcileOutcome::Stale);
                }
                Some(row) => {
                    diesel::update(provider_subscriptions::table.filter(provider_subscriptions::id.eq(&row.id)))
                        .set((
                            provider_subscriptions::status.eq(status),
                            provider_subscriptions::current_period_end.eq(period_end),
                            provider_subscriptions::last_event_at.eq(event_at),
                            provider_subscriptions::updated_at.eq(now),
                        ))
                        .execute(conn)?;
                }
                None => {
                    let row = ProviderSubscription {
                        id: new_id(),
                        tenant_id: tenant_id.clone(),
                        provider_subscription_id: sub.id.clone(),
                        status: status.to_string(),
                        current_period_end: period_end,
                        last_event_at: event_at,
                        updated_at: now,
                    };
                    diesel::insert_into(provider_subscriptions::table)
                        .values(&row)
                        .execute(conn)?;
                }
            }

            tracing::info!(tenant_id = %tenant_id, subscription_id = %sub.id, status, "Subscription state applied");
            record_event(conn, event, Some(&sub.id), ReconcileOutcome::Applied)
        })
    })
}

pub fn get_subscription(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    provider_subscription_id: &str,
) -> CoreResult<ProviderSubscription> {
    find_subscription(conn, provider_subscription_id)?
        .filter(|row| row.tenant_id == tenant_id)
        .ok_or_else(|| CoreError::not_found("subscription", provider_subscription_id))
}

/// Async entry point: verify, reconcile on a blocking thread, then run the
/// follow-up effects once the authoritative write has committed.
#[derive(Clone)]
pub struct WebhookReconciler {
    pool: DbPool,
    effects: EffectRunner,
}

impl WebhookReconciler {
    pub fn new(pool: DbPool, effects: EffectRunner) -> Self {
        Self { pool, effects }
    }

    pub async fn handle_delivery(
        &self,
        stripe: &StripeClient,
        payload: &str,
        signature: &str,
    ) -> CoreResult<ReconcileOutcome> {
        let event = stripe.verify_webhook_signature(payload, signature)?;
        self.reconcile(event).await
    }

    pub async fn reconcile(&self, event: StripeWebhookEvent) -> CoreResult<ReconcileOutcome> {
        let pool = self.pool.clone();
        let committed = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            reconcile_event(&mut conn, &event)
        })
        .await??;

        Ok(self.effects.complete(committed).await)
    }
}
