use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::SqliteConnection;
use serde::{Deserialize, Serialize};

use crate::attribution::{FunnelLinks, FunnelStage, FunnelSubject};
use crate::billing::models::{Invoice, InvoiceDetail, InvoiceLineItem, Payment, PaymentApplied};
use crate::billing::sequence::{allocate, DocumentKind};
use crate::billing::status::{InvoiceStatus, PaymentMethod, PaymentStatus};
use crate::billing::stripe_integration::{PaymentIntentRequest, PaymentProcessor};
use crate::billing::totals::{compute_totals, price_lines, validate_tax_rate, DocumentTotals, LineItemInput, PricedLine};
use crate::core::context::CallerContext;
use crate::core::effects::{Committed, SideEffect};
use crate::core::error::{CoreError, CoreResult};
use crate::core::lifecycle::{ensure_transition, Lifecycle};
use crate::core::shared::schema::{invoice_line_items, invoices, payments};
use crate::core::shared::tenancy::{ensure_customer, ensure_job_for_customer};
use crate::core::shared::utils::{new_id, now_utc, with_retry, DbPool};
use crate::notifications::{TemplateKind, TemplateVars};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInvoiceInput {
    pub customer_id: String,
    pub job_id: Option<String>,
    #[serde(default)]
    pub tax_rate_bps: i32,
    pub line_items: Vec<LineItemInput>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManualPaymentInput {
    pub amount: i64,
    pub method: PaymentMethod,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PaymentIntentResponse {
    pub invoice_id: String,
    pub intent_id: String,
    pub client_secret: Option<String>,
    pub amount: i64,
    pub reused: bool,
}

/// Everything needed to write a new invoice and its line items.
pub(crate) struct NewInvoiceDocument {
    pub tenant_id: String,
    pub customer_id: String,
    pub job_id: Option<String>,
    pub estimate_id: Option<String>,
    pub tax_rate_bps: i32,
    pub totals: DocumentTotals,
    pub is_deposit: bool,
    pub notes: Option<String>,
}

/// Allocate an `INV-` number and insert the invoice with its line items.
/// Must be called inside an immediate transaction.
pub(crate) fn insert_invoice_document(
    conn: &mut SqliteConnection,
    doc: NewInvoiceDocument,
    lines: &[PricedLine],
) -> CoreResult<InvoiceDetail> {
    let number = allocate(conn, &doc.tenant_id, DocumentKind::Invoice)?;
    let now = now_utc();

    let invoice = Invoice {
        id: new_id(),
        tenant_id: doc.tenant_id,
        customer_id: doc.customer_id,
        job_id: doc.job_id,
        estimate_id: doc.estimate_id,
        invoice_number: number,
        status: InvoiceStatus::Draft.as_str().to_string(),
        tax_rate_bps: doc.tax_rate_bps,
        subtotal: doc.totals.subtotal,
        tax_amount: doc.totals.tax_amount,
        total: doc.totals.total,
        paid_amount: 0,
        is_deposit: doc.is_deposit,
        payment_intent_id: None,
        notes: doc.notes,
        sent_at: None,
        paid_at: None,
        voided_at: None,
        created_at: now,
        updated_at: now,
    };

    diesel::insert_into(invoices::table)
        .values(&invoice)
        .execute(conn)?;

    let line_items: Vec<InvoiceLineItem> = lines
        .iter()
        .enumerate()
        .map(|(idx, line)| InvoiceLineItem {
            id: new_id(),
            invoice_id: invoice.id.clone(),
            tenant_id: invoice.tenant_id.clone(),
            description: line.description.clone(),
            quantity: line.quantity,
            unit_price: line.unit_price,
            line_total: line.line_total,
            sort_order: idx as i32,
        })
        .collect();

    diesel::insert_into(invoice_line_items::table)
        .values(&line_items)
        .execute(conn)?;

    Ok(InvoiceDetail { invoice, line_items })
}

pub fn load_invoice(conn: &mut SqliteConnection, tenant_id: &str, invoice_id: &str) -> CoreResult<Invoice> {
    invoices::table
        .filter(invoices::tenant_id.eq(tenant_id))
        .filter(invoices::id.eq(invoice_id))
        .select(Invoice::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| CoreError::not_found("invoice", invoice_id))
}

pub fn get_invoice(conn: &mut SqliteConnection, ctx: &CallerContext, invoice_id: &str) -> CoreResult<InvoiceDetail> {
    let invoice = load_invoice(conn, &ctx.tenant_id, invoice_id)?;
    let line_items = invoice_line_items::table
        .filter(invoice_line_items::tenant_id.eq(&ctx.tenant_id))
        .filter(invoice_line_items::invoice_id.eq(&invoice.id))
        .order(invoice_line_items::sort_order.asc())
        .select(InvoiceLineItem::as_select())
        .load(conn)?;
    Ok(InvoiceDetail { invoice, line_items })
}

pub fn list_payments(conn: &mut SqliteConnection, ctx: &CallerContext, invoice_id: &str) -> CoreResult<Vec<Payment>> {
    load_invoice(conn, &ctx.tenant_id, invoice_id)?;
    Ok(payments::table
        .filter(payments::tenant_id.eq(&ctx.tenant_id))
        .filter(payments::invoice_id.eq(invoice_id))
        .order(payments::created_at.asc())
        .select(Payment::as_select())
        .load(conn)?)
}

pub fn create_invoice(
    conn: &mut SqliteConnection,
    ctx: &CallerContext,
    input: CreateInvoiceInput,
) -> CoreResult<InvoiceDetail> {
    validate_tax_rate(input.tax_rate_bps)?;
    let lines = price_lines(&input.line_items)?;
    let totals = compute_totals(&lines, input.tax_rate_bps)?;

    let detail = with_retry("create_invoice", || {
        conn.immediate_transaction(|conn| {
            ensure_customer(conn, &ctx.tenant_id, &input.customer_id)?;
            if let Some(job_id) = &input.job_id {
                ensure_job_for_customer(conn, &ctx.tenant_id, job_id, &input.customer_id)?;
            }

            insert_invoice_document(
                conn,
                NewInvoiceDocument {
                    tenant_id: ctx.tenant_id.clone(),
                    customer_id: input.customer_id.clone(),
                    job_id: input.job_id.clone(),
                    estimate_id: None,
                    tax_rate_bps: input.tax_rate_bps,
                    totals,
                    is_deposit: false,
                    notes: input.notes.clone(),
                },
                &lines,
            )
        })
    })?;

    tracing::info!(
        tenant_id = %ctx.tenant_id,
        caller_id = %ctx.caller_id,
        caller_role = ctx.role.as_str(),
        invoice_id = %detail.invoice.id,
        invoice_number = %detail.invoice.invoice_number,
        total = detail.invoice.total,
        "Invoice created"
    );
    Ok(detail)
}

fn set_invoice_status(
    conn: &mut SqliteConnection,
    invoice: &Invoice,
    next: InvoiceStatus,
    now: NaiveDateTime,
) -> CoreResult<Invoice> {
    let target = invoices::table
        .filter(invoices::tenant_id.eq(&invoice.tenant_id))
        .filter(invoices::id.eq(&invoice.id));

    match next {
        InvoiceStatus::Sent => diesel::update(target)
            .set((
                invoices::status.eq(next.as_str()),
                invoices::sent_at.eq(Some(now)),
                invoices::updated_at.eq(now),
            ))
            .execute(conn)?,
        InvoiceStatus::Void => diesel::update(target)
            .set((
                invoices::status.eq(next.as_str()),
                invoices::voided_at.eq(Some(now)),
                invoices::updated_at.eq(now),
            ))
            .execute(conn)?,
        _ => diesel::update(target)
            .set((invoices::status.eq(next.as_str()), invoices::updated_at.eq(now)))
            .execute(conn)?,
    };

    load_invoice(conn, &invoice.tenant_id, &invoice.id)
}

fn transition_invoice(
    conn: &mut SqliteConnection,
    ctx: &CallerContext,
    invoice_id: &str,
    next: InvoiceStatus,
    action: &'static str,
) -> CoreResult<Invoice> {
    let invoice = with_retry(action, || {
        conn.immediate_transaction(|conn| {
            let invoice = load_invoice(conn, &ctx.tenant_id, invoice_id)?;
            ensure_transition(invoice.status()?, next, action)?;
            set_invoice_status(conn, &invoice, next, now_utc())
        })
    })?;

    tracing::info!(
        tenant_id = %ctx.tenant_id,
        caller_id = %ctx.caller_id,
        caller_role = ctx.role.as_str(),
        invoice_id,
        status = next.as_str(),
        "Invoice status changed"
    );
    Ok(invoice)
}

pub fn send_invoice(conn: &mut SqliteConnection, ctx: &CallerContext, invoice_id: &str) -> CoreResult<Committed<Invoice>> {
    let invoice = transition_invoice(conn, ctx, invoice_id, InvoiceStatus::Sent, "send")?;

    let mut variables = TemplateVars::new();
    variables.insert("invoice_number".to_string(), invoice.invoice_number.clone());
    variables.insert("total".to_string(), invoice.total.to_string());
    variables.insert("balance_due".to_string(), invoice.balance_due().to_string());

    let notify = SideEffect::Notify {
        tenant_id: invoice.tenant_id.clone(),
        customer_id: invoice.customer_id.clone(),
        template: TemplateKind::InvoiceSent,
        variables,
    };
    Ok(Committed::new(invoice).with(notify))
}

pub fn void_invoice(conn: &mut SqliteConnection, ctx: &CallerContext, invoice_id: &str) -> CoreResult<Invoice> {
    transition_invoice(conn, ctx, invoice_id, InvoiceStatus::Void, "void")
}

/// Informational marker set by collaborators; repeating it is a no-op.
pub fn mark_invoice_viewed(conn: &mut SqliteConnection, ctx: &CallerContext, invoice_id: &str) -> CoreResult<Invoice> {
    mark_invoice(conn, ctx, invoice_id, InvoiceStatus::Viewed, "mark viewed")
}

pub fn mark_invoice_overdue(conn: &mut SqliteConnection, ctx: &CallerContext, invoice_id: &str) -> CoreResult<Invoice> {
    mark_invoice(conn, ctx, invoice_id, InvoiceStatus::Overdue, "mark overdue")
}

fn mark_invoice(
    conn: &mut SqliteConnection,
    ctx: &CallerContext,
    invoice_id: &str,
    marker: InvoiceStatus,
    action: &'static str,
) -> CoreResult<Invoice> {
    with_retry(action, || {
        conn.immediate_transaction(|conn| {
            let invoice = load_invoice(conn, &ctx.tenant_id, invoice_id)?;
            let current = invoice.status()?;
            if current == marker {
                return Ok(invoice);
            }
            ensure_transition(current, marker, action)?;
            set_invoice_status(conn, &invoice, marker, now_utc())
        })
    })
}

pub(crate) struct NewPayment<'a> {
    pub invoice: &'a Invoice,
    pub amount: i64,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub payment_intent_id: Option<String>,
    pub note: Option<String>,
}

pub(crate) fn insert_payment(conn: &mut SqliteConnection, new: NewPayment<'_>) -> CoreResult<Payment> {
    let now = now_utc();
    let payment = Payment {
        id: new_id(),
        tenant_id: new.invoice.tenant_id.clone(),
        invoice_id: new.invoice.id.clone(),
        customer_id: new.invoice.customer_id.clone(),
        amount: new.amount,
        method: new.method.as_str().to_string(),
        status: new.status.as_str().to_string(),
        payment_intent_id: new.payment_intent_id,
        note: new.note,
        processed_at: now,
        created_at: now,
    };

    diesel::insert_into(payments::table)
        .values(&payment)
        .execute(conn)?;
    Ok(payment)
}

/// Add a succeeded payment to the invoice accumulator. `paid_amount` only
/// grows; a paid invoice stays paid.
pub(crate) fn accumulate_payment(conn: &mut SqliteConnection, invoice: &Invoice, amount: i64) -> CoreResult<Invoice> {
    let current = invoice.status()?;
    let paid_amount = invoice
        .paid_amount
        .checked_add(amount)
        .ok_or_else(|| CoreError::Validation("paid amount out of range".to_string()))?;

    let next = if current == InvoiceStatus::Paid {
        InvoiceStatus::Paid
    } else {
        let next = InvoiceStatus::after_payment(paid_amount, invoice.total);
        ensure_transition(current, next, "record payment on")?;
        next
    };

    let now = now_utc();
    let paid_at = if next == InvoiceStatus::Paid {
        invoice.paid_at.or(Some(now))
    } else {
        None
    };

    diesel::update(
        invoices::table
            .filter(invoices::tenant_id.eq(&invoice.tenant_id))
            .filter(invoices::id.eq(&invoice.id)),
    )
    .set((
        invoices::paid_amount.eq(paid_amount),
        invoices::status.eq(next.as_str()),
        invoices::paid_at.eq(paid_at),
        invoices::updated_at.eq(now),
    ))
    .execute(conn)?;

    load_invoice(conn, &invoice.tenant_id, &invoice.id)
}

/// Follow-up work after a succeeded payment is durably applied.
pub(crate) fn payment_effects(applied: &PaymentApplied, was_paid: bool) -> Vec<SideEffect> {
    let invoice = &applied.invoice;
    let mut variables = TemplateVars::new();
    variables.insert("invoice_number".to_string(), invoice.invoice_number.clone());
    variables.insert("amount".to_string(), applied.payment.amount.to_string());
    variables.insert("balance_due".to_string(), invoice.balance_due().to_string());

    let mut effects = vec![SideEffect::Notify {
        tenant_id: invoice.tenant_id.clone(),
        customer_id: invoice.customer_id.clone(),
        template: TemplateKind::PaymentReceived,
        variables,
    }];

    let now_paid = invoice.status == InvoiceStatus::Paid.as_str();
    if now_paid && !was_paid && !invoice.is_deposit {
        if let Some(job_id) = &invoice.job_id {
            effects.push(SideEffect::AdvanceFunnel {
                tenant_id: invoice.tenant_id.clone(),
                subject: FunnelSubject::Job(job_id.clone()),
                stage: FunnelStage::PaymentCollected,
                value: Some(invoice.paid_amount),
                links: FunnelLinks::new(Some(invoice.customer_id.clone()), Some(job_id.clone())),
            });
        }
    }
    effects
}

pub fn record_manual_payment(
    conn: &mut SqliteConnection,
    ctx: &CallerContext,
    invoice_id: &str,
    input: ManualPaymentInput,
) -> CoreResult<Committed<PaymentApplied>> {
    if input.amount <= 0 {
        return Err(CoreError::Validation(format!(
            "payment amount must be positive, got {}",
            input.amount
        )));
    }

    let applied = with_retry("record_manual_payment", || {
        conn.immediate_transaction(|conn| {
            let invoice = load_invoice(conn, &ctx.tenant_id, invoice_id)?;
            let current = invoice.status()?;
            if current.is_terminal() {
                return Err(CoreError::StateConflict {
                    entity: InvoiceStatus::ENTITY,
                    status: current.as_str().to_string(),
                    action: "record payment on",
                });
            }

            let payment = insert_payment(
                conn,
                NewPayment {
                    invoice: &invoice,
                    amount: input.amount,
                    method: input.method,
                    status: PaymentStatus::Succeeded,
                    payment_intent_id: None,
                    note: input.note.clone(),
                },
            )?;
            let invoice = accumulate_payment(conn, &invoice, input.amount)?;
            Ok(PaymentApplied { payment, invoice })
        })
    })?;

    tracing::info!(
        tenant_id = %ctx.tenant_id,
        caller_id = %ctx.caller_id,
        caller_role = ctx.role.as_str(),
        invoice_id,
        amount = input.amount,
        paid_amount = applied.invoice.paid_amount,
        status = %applied.invoice.status,
        "Manual payment recorded"
    );

    let effects = payment_effects(&applied, false);
    Ok(Committed::new(applied).with_all(effects))
}

/// Hand out a processor payment intent for the invoice's open balance.
///
/// A still-open intent for the same amount is reused. An intent that is
/// processing, awaiting capture or already succeeded blocks a new one until
/// its webhook settles the invoice. A new intent whose id
/// cannot be stored on the invoice is cancelled again so no authorization is
/// left without a local record.
pub async fn create_payment_intent(
    pool: &DbPool,
    processor: &dyn PaymentProcessor,
    ctx: &CallerContext,
    invoice_id: &str,
    currency: &str,
) -> CoreResult<PaymentIntentResponse> {
    let invoice = {
        let pool = pool.clone();
        let tenant_id = ctx.tenant_id.clone();
        let invoice_id = invoice_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            load_invoice(&mut conn, &tenant_id, &invoice_id)
        })
        .await??
    };

    let status = invoice.status()?;
    if status.is_terminal() {
        return Err(CoreError::StateConflict {
            entity: InvoiceStatus::ENTITY,
            status: status.as_str().to_string(),
            action: "collect payment for",
        });
    }
    let amount = invoice.balance_due();
    if amount <= 0 {
        return Err(CoreError::Validation(format!(
            "invoice {} has no balance due",
            invoice.invoice_number
        )));
    }

    if let Some(existing) = &invoice.payment_intent_id {
        match processor.get_payment_intent(existing).await {
            Ok(intent) if intent.status.is_open() && intent.amount == amount => {
                tracing::debug!(tenant_id = %ctx.tenant_id, invoice_id, intent_id = %existing, "Reusing open payment intent");
                return Ok(PaymentIntentResponse {
                    invoice_id: invoice.id,
                    intent_id: intent.intent_id,
                    client_secret: intent.client_secret,
                    amount,
                    reused: true,
                });
            }
            Ok(intent) if intent.status.is_open() => {
                if let Err(e) = processor.cancel_payment_intent(existing).await {
                    tracing::warn!(intent_id = %existing, error = %e, "Failed to cancel superseded payment intent");
                }
            }
            Ok(intent) if intent.status.is_in_flight() => {
                tracing::warn!(
                    tenant_id = %ctx.tenant_id,
                    invoice_id,
                    intent_id = %existing,
                    intent_status = intent.status.as_str(),
                    "Payment already in flight, refusing a second intent"
                );
                return Err(CoreError::StateConflict {
                    entity: InvoiceStatus::ENTITY,
                    status: intent.status.as_str().to_string(),
                    action: "collect payment for",
                });
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(intent_id = %existing, error = %e, "Could not look up existing payment intent");
            }
        }
    }

    let mut metadata = BTreeMap::new();
    metadata.insert("tenant_id".to_string(), ctx.tenant_id.clone());
    metadata.insert("invoice_id".to_string(), invoice.id.clone());
    metadata.insert("invoice_number".to_string(), invoice.invoice_number.clone());

    let created = processor
        .create_payment_intent(&PaymentIntentRequest {
            amount,
            currency: currency.to_string(),
            metadata,
        })
        .await?;

    let persisted = {
        let pool = pool.clone();
        let tenant_id = ctx.tenant_id.clone();
        let invoice_id = invoice.id.clone();
        let previous = invoice.payment_intent_id.clone();
        let intent_id = created.intent_id.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            store_payment_intent(&mut conn, &tenant_id, &invoice_id, previous.as_deref(), &intent_id)
        })
        .await
        .map_err(CoreError::from)
        .and_then(|result| result)
    };

    if let Err(e) = persisted {
        tracing::warn!(
            tenant_id = %ctx.tenant_id,
            invoice_id,
            intent_id = %created.intent_id,
            error = %e,
            "Failed to store payment intent, cancelling it"
        );
        if let Err(cancel_err) = processor.cancel_payment_intent(&created.intent_id).await {
            tracing::error!(
                intent_id = %created.intent_id,
                error = %cancel_err,
                "Orphaned payment intent could not be cancelled"
            );
        }
        return Err(e);
    }

    tracing::info!(
        tenant_id = %ctx.tenant_id,
        invoice_id,
        intent_id = %created.intent_id,
        amount,
        "Payment intent created"
    );

    Ok(PaymentIntentResponse {
        invoice_id: invoice.id,
        intent_id: created.intent_id,
        client_secret: created.client_secret,
        amount,
        reused: false,
    })
}

/// Store the intent id only if the invoice is still payable and nobody else
/// attached an intent since it was read.
fn store_payment_intent(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    invoice_id: &str,
    previous: Option<&str>,
    intent_id: &str,
) -> CoreResult<()> {
    conn.immediate_transaction(|conn| {
        let invoice = load_invoice(conn, tenant_id, invoice_id)?;
        let status = invoice.status()?;
        if status.is_terminal() {
            return Err(CoreError::StateConflict {
                entity: InvoiceStatus::ENTITY,
                status: status.as_str().to_string(),
                action: "attach payment intent to",
            });
        }
        if invoice.payment_intent_id.as_deref() != previous {
            return Err(CoreError::TransientConflict(format!(
                "invoice {invoice_id} payment intent changed concurrently"
            )));
        }

        diesel::update(
            invoices::table
                .filter(invoices::tenant_id.eq(tenant_id))
                .filter(invoices::id.eq(invoice_id)),
        )
        .set((
            invoices::payment_intent_id.eq(Some(intent_id)),
            invoices::updated_at.eq(now_utc()),
        ))
        .execute(conn)?;
        Ok(())
    })
}
