use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::SqliteConnection;
use serde::Deserialize;

use crate::attribution::{FunnelLinks, FunnelStage, FunnelSubject};
use crate::billing::invoices::{insert_invoice_document, NewInvoiceDocument};
use crate::billing::models::{Conversion, DepositRequest, Estimate, EstimateDetail, EstimateLineItem};
use crate::billing::sequence::{allocate, DocumentKind};
use crate::billing::status::EstimateStatus;
use crate::billing::totals::{
    compute_totals, deposit_amount, price_lines, validate_tax_rate, DocumentTotals, LineItemInput, PricedLine,
};
use crate::core::context::CallerContext;
use crate::core::effects::{Committed, SideEffect};
use crate::core::error::{CoreError, CoreResult};
use crate::core::lifecycle::{ensure_transition, Lifecycle};
use crate::core::shared::schema::{estimate_line_items, estimates, invoices};
use crate::core::shared::tenancy::{ensure_customer, ensure_job_for_customer};
use crate::core::shared::utils::{new_id, now_utc, with_retry};
use crate::notifications::{TemplateKind, TemplateVars};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateEstimateInput {
    pub customer_id: String,
    pub job_id: Option<String>,
    #[serde(default)]
    pub tax_rate_bps: i32,
    pub line_items: Vec<LineItemInput>,
    pub notes: Option<String>,
}

/// Fields left out are kept. A present `line_items` replaces the whole set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateEstimateInput {
    pub tax_rate_bps: Option<i32>,
    pub line_items: Option<Vec<LineItemInput>>,
    pub notes: Option<String>,
}

/// Explicit `amount` wins over `percent`; neither means the configured default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DepositInput {
    pub amount: Option<i64>,
    pub percent: Option<u32>,
}

pub fn load_estimate(conn: &mut SqliteConnection, tenant_id: &str, estimate_id: &str) -> CoreResult<Estimate> {
    estimates::table
        .filter(estimates::tenant_id.eq(tenant_id))
        .filter(estimates::id.eq(estimate_id))
        .select(Estimate::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| CoreError::not_found("estimate", estimate_id))
}

fn load_line_items(conn: &mut SqliteConnection, estimate: &Estimate) -> CoreResult<Vec<EstimateLineItem>> {
    Ok(estimate_line_items::table
        .filter(estimate_line_items::tenant_id.eq(&estimate.tenant_id))
        .filter(estimate_line_items::estimate_id.eq(&estimate.id))
        .order(estimate_line_items::sort_order.asc())
        .select(EstimateLineItem::as_select())
        .load(conn)?)
}

fn insert_line_items(
    conn: &mut SqliteConnection,
    estimate: &Estimate,
    lines: &[PricedLine],
) -> CoreResult<Vec<EstimateLineItem>> {
    let items: Vec<EstimateLineItem> = lines
        .iter()
        .enumerate()
        .map(|(idx, line)| EstimateLineItem {
            id: new_id(),
            estimate_id: estimate.id.clone(),
            tenant_id: estimate.tenant_id.clone(),
            description: line.description.clone(),
            quantity: line.quantity,
            unit_price: line.unit_price,
            line_total: line.line_total,
            sort_order: idx as i32,
        })
        .collect();

    diesel::insert_into(estimate_line_items::table)
        .values(&items)
        .execute(conn)?;
    Ok(items)
}

pub fn get_estimate(conn: &mut SqliteConnection, ctx: &CallerContext, estimate_id: &str) -> CoreResult<EstimateDetail> {
    let estimate = load_estimate(conn, &ctx.tenant_id, estimate_id)?;
    let line_items = load_line_items(conn, &estimate)?;
    Ok(EstimateDetail { estimate, line_items })
}

/// Number allocation, the estimate row and its line items commit together.
pub fn create_estimate(
    conn: &mut SqliteConnection,
    ctx: &CallerContext,
    input: CreateEstimateInput,
) -> CoreResult<EstimateDetail> {
    validate_tax_rate(input.tax_rate_bps)?;
    let lines = price_lines(&input.line_items)?;
    let totals = compute_totals(&lines, input.tax_rate_bps)?;

    let detail = with_retry("create_estimate", || {
        conn.immediate_transaction(|conn| {
            ensure_customer(conn, &ctx.tenant_id, &input.customer_id)?;
            if let Some(job_id) = &input.job_id {
                ensure_job_for_customer(conn, &ctx.tenant_id, job_id, &input.customer_id)?;
            }

            let number = allocate(conn, &ctx.tenant_id, DocumentKind::Estimate)?;
            let now = now_utc();
            let estimate = Estimate {
                id: new_id(),
                tenant_id: ctx.tenant_id.clone(),
                customer_id: input.customer_id.clone(),
                job_id: input.job_id.clone(),
                estimate_number: number,
                status: EstimateStatus::Draft.as_str().to_string(),
                tax_rate_bps: input.tax_rate_bps,
                subtotal: totals.subtotal,
                tax_amount: totals.tax_amount,
                total: totals.total,
                notes: input.notes.clone(),
                deposit_requested: false,
                deposit_invoice_id: None,
                deposit_requested_at: None,
                converted_invoice_id: None,
                sent_at: None,
                approved_at: None,
                declined_at: None,
                voided_at: None,
                created_at: now,
                updated_at: now,
            };

            diesel::insert_into(estimates::table)
                .values(&estimate)
                .execute(conn)?;
            let line_items = insert_line_items(conn, &estimate, &lines)?;
            Ok(EstimateDetail { estimate, line_items })
        })
    })?;

    tracing::info!(
        tenant_id = %ctx.tenant_id,
        caller_id = %ctx.caller_id,
        caller_role = ctx.role.as_str(),
        estimate_id = %detail.estimate.id,
        estimate_number = %detail.estimate.estimate_number,
        total = detail.estimate.total,
        "Estimate created"
    );
    Ok(detail)
}

/// Draft-only edit. Totals are always recomputed from the stored line items.
pub fn update_estimate(
    conn: &mut SqliteConnection,
    ctx: &CallerContext,
    estimate_id: &str,
    input: UpdateEstimateInput,
) -> CoreResult<EstimateDetail> {
    if let Some(rate) = input.tax_rate_bps {
        validate_tax_rate(rate)?;
    }
    let replacement = input.line_items.as_deref().map(price_lines).transpose()?;

    let detail = with_retry("update_estimate", || {
        conn.immediate_transaction(|conn| {
            let estimate = load_estimate(conn, &ctx.tenant_id, estimate_id)?;
            let status = estimate.status()?;
            if !status.is_editable() {
                return Err(CoreError::StateConflict {
                    entity: EstimateStatus::ENTITY,
                    status: status.as_str().to_string(),
                    action: "edit",
                });
            }

            let lines: Vec<PricedLine> = match &replacement {
                Some(lines) => {
                    diesel::delete(
                        estimate_line_items::table
                            .filter(estimate_line_items::tenant_id.eq(&ctx.tenant_id))
                            .filter(estimate_line_items::estimate_id.eq(&estimate.id)),
                    )
                    .execute(conn)?;
                    insert_line_items(conn, &estimate, lines)?;
                    lines.clone()
                }
                None => load_line_items(conn, &estimate)?
                    .into_iter()
                    .map(|item| PricedLine {
                        description: item.description,
                        quantity: item.quantity,
                        unit_price: item.unit_price,
                        line_total: item.line_total,
                    })
                    .collect(),
            };

            let tax_rate_bps = input.tax_rate_bps.unwrap_or(estimate.tax_rate_bps);
            let totals = compute_totals(&lines, tax_rate_bps)?;
            let notes = input.notes.clone().or_else(|| estimate.notes.clone());

            diesel::update(
                estimates::table
                    .filter(estimates::tenant_id.eq(&ctx.tenant_id))
                    .filter(estimates::id.eq(&estimate.id)),
            )
            .set((
                estimates::tax_rate_bps.eq(tax_rate_bps),
                estimates::subtotal.eq(totals.subtotal),
                estimates::tax_amount.eq(totals.tax_amount),
                estimates::total.eq(totals.total),
                estimates::notes.eq(notes),
                estimates::updated_at.eq(now_utc()),
            ))
            .execute(conn)?;

            let estimate = load_estimate(conn, &ctx.tenant_id, estimate_id)?;
            let line_items = load_line_items(conn, &estimate)?;
            Ok(EstimateDetail { estimate, line_items })
        })
    })?;

    tracing::info!(
        tenant_id = %ctx.tenant_id,
        caller_id = %ctx.caller_id,
        caller_role = ctx.role.as_str(),
        estimate_id,
        total = detail.estimate.total,
        replaced_lines = replacement.is_some(),
        "Estimate updated"
    );
    Ok(detail)
}

fn set_estimate_status(
    conn: &mut SqliteConnection,
    estimate: &Estimate,
    next: EstimateStatus,
    now: NaiveDateTime,
) -> CoreResult<Estimate> {
    let target = estimates::table
        .filter(estimates::tenant_id.eq(&estimate.tenant_id))
        .filter(estimates::id.eq(&estimate.id));

    match next {
        EstimateStatus::Sent => diesel::update(target)
            .set((
                estimates::status.eq(next.as_str()),
                estimates::sent_at.eq(Some(now)),
                estimates::updated_at.eq(now),
            ))
            .execute(conn)?,
        EstimateStatus::Approved => diesel::update(target)
            .set((
                estimates::status.eq(next.as_str()),
                estimates::approved_at.eq(Some(now)),
                estimates::updated_at.eq(now),
            ))
            .execute(conn)?,
        EstimateStatus::Declined => diesel::update(target)
            .set((
                estimates::status.eq(next.as_str()),
                estimates::declined_at.eq(Some(now)),
                estimates::updated_at.eq(now),
            ))
            .execute(conn)?,
        EstimateStatus::Voided => diesel::update(target)
            .set((
                estimates::status.eq(next.as_str()),
                estimates::voided_at.eq(Some(now)),
                estimates::updated_at.eq(now),
            ))
            .execute(conn)?,
        _ => diesel::update(target)
            .set((estimates::status.eq(next.as_str()), estimates::updated_at.eq(now)))
            .execute(conn)?,
    };

    load_estimate(conn, &estimate.tenant_id, &estimate.id)
}

fn transition_estimate(
    conn: &mut SqliteConnection,
    ctx: &CallerContext,
    estimate_id: &str,
    next: EstimateStatus,
    action: &'static str,
) -> CoreResult<Estimate> {
    let estimate = with_retry(action, || {
        conn.immediate_transaction(|conn| {
            let estimate = load_estimate(conn, &ctx.tenant_id, estimate_id)?;
            ensure_transition(estimate.status()?, next, action)?;
            set_estimate_status(conn, &estimate, next, now_utc())
        })
    })?;

    tracing::info!(
        tenant_id = %ctx.tenant_id,
        caller_id = %ctx.caller_id,
        caller_role = ctx.role.as_str(),
        estimate_id,
        status = next.as_str(),
        "Estimate status changed"
    );
    Ok(estimate)
}

/// Funnel advance for estimates tied to a job; loose estimates have no lead.
fn funnel_effect(estimate: &Estimate, stage: FunnelStage) -> Option<SideEffect> {
    let job_id = estimate.job_id.as_ref()?;
    Some(SideEffect::AdvanceFunnel {
        tenant_id: estimate.tenant_id.clone(),
        subject: FunnelSubject::Job(job_id.clone()),
        stage,
        value: Some(estimate.total),
        links: FunnelLinks::new(Some(estimate.customer_id.clone()), Some(job_id.clone())),
    })
}

pub fn send_estimate(
    conn: &mut SqliteConnection,
    ctx: &CallerContext,
    estimate_id: &str,
) -> CoreResult<Committed<Estimate>> {
    let estimate = transition_estimate(conn, ctx, estimate_id, EstimateStatus::Sent, "send")?;

    let mut variables = TemplateVars::new();
    variables.insert("estimate_number".to_string(), estimate.estimate_number.clone());
    variables.insert("total".to_string(), estimate.total.to_string());

    let notify = SideEffect::Notify {
        tenant_id: estimate.tenant_id.clone(),
        customer_id: estimate.customer_id.clone(),
        template: TemplateKind::EstimateSent,
        variables,
    };
    let funnel = funnel_effect(&estimate, FunnelStage::QuoteSent);
    Ok(Committed::new(estimate).with(notify).with_all(funnel))
}

pub fn approve_estimate(
    conn: &mut SqliteConnection,
    ctx: &CallerContext,
    estimate_id: &str,
) -> CoreResult<Committed<Estimate>> {
    let estimate = transition_estimate(conn, ctx, estimate_id, EstimateStatus::Approved, "approve")?;
    let funnel = funnel_effect(&estimate, FunnelStage::QuoteApproved);
    Ok(Committed::new(estimate).with_all(funnel))
}

pub fn decline_estimate(conn: &mut SqliteConnection, ctx: &CallerContext, estimate_id: &str) -> CoreResult<Estimate> {
    transition_estimate(conn, ctx, estimate_id, EstimateStatus::Declined, "decline")
}

pub fn void_estimate(conn: &mut SqliteConnection, ctx: &CallerContext, estimate_id: &str) -> CoreResult<Estimate> {
    transition_estimate(conn, ctx, estimate_id, EstimateStatus::Voided, "void")
}

/// Mark the estimate converted and issue an invoice carrying a copy of its
/// line items and totals, in one transaction.
pub fn convert_to_invoice(
    conn: &mut SqliteConnection,
    ctx: &CallerContext,
    estimate_id: &str,
) -> CoreResult<Conversion> {
    let conversion = with_retry("convert_estimate", || {
        conn.immediate_transaction(|conn| {
            let estimate = load_estimate(conn, &ctx.tenant_id, estimate_id)?;
            ensure_transition(estimate.status()?, EstimateStatus::Converted, "convert")?;
            let Some(job_id) = estimate.job_id.clone() else {
                return Err(CoreError::Validation(format!(
                    "estimate {} has no job and cannot be invoiced",
                    estimate.estimate_number
                )));
            };

            let lines: Vec<PricedLine> = load_line_items(conn, &estimate)?
                .into_iter()
                .map(|item| PricedLine {
                    description: item.description,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    line_total: item.line_total,
                })
                .collect();

            // The deposit stays a separate invoice; the conversion bills the full total.
            let notes = match &estimate.deposit_invoice_id {
                Some(deposit_id) => {
                    let deposit_number: String = invoices::table
                        .filter(invoices::tenant_id.eq(&ctx.tenant_id))
                        .filter(invoices::id.eq(deposit_id))
                        .select(invoices::invoice_number)
                        .first(conn)?;
                    let line = format!("Deposit invoice {deposit_number} ({deposit_id}) billed separately");
                    Some(match estimate.notes.as_deref().filter(|n| !n.trim().is_empty()) {
                        Some(existing) => format!("{existing}\n{line}"),
                        None => line,
                    })
                }
                None => estimate.notes.clone(),
            };

            let invoice = insert_invoice_document(
                conn,
                NewInvoiceDocument {
                    tenant_id: estimate.tenant_id.clone(),
                    customer_id: estimate.customer_id.clone(),
                    job_id: Some(job_id),
                    estimate_id: Some(estimate.id.clone()),
                    tax_rate_bps: estimate.tax_rate_bps,
                    totals: DocumentTotals {
                        subtotal: estimate.subtotal,
                        tax_amount: estimate.tax_amount,
                        total: estimate.total,
                    },
                    is_deposit: false,
                    notes,
                },
                &lines,
            )?;

            let now = now_utc();
            diesel::update(
                estimates::table
                    .filter(estimates::tenant_id.eq(&ctx.tenant_id))
                    .filter(estimates::id.eq(&estimate.id)),
            )
            .set((
                estimates::status.eq(EstimateStatus::Converted.as_str()),
                estimates::converted_invoice_id.eq(Some(&invoice.invoice.id)),
                estimates::updated_at.eq(now),
            ))
            .execute(conn)?;

            let estimate = load_estimate(conn, &ctx.tenant_id, estimate_id)?;
            Ok(Conversion { estimate, invoice })
        })
    })?;

    tracing::info!(
        tenant_id = %ctx.tenant_id,
        caller_id = %ctx.caller_id,
        caller_role = ctx.role.as_str(),
        estimate_id,
        invoice_id = %conversion.invoice.invoice.id,
        invoice_number = %conversion.invoice.invoice.invoice_number,
        "Estimate converted to invoice"
    );
    Ok(conversion)
}

/// Issue the single deposit invoice for an approved estimate.
pub fn request_deposit(
    conn: &mut SqliteConnection,
    ctx: &CallerContext,
    estimate_id: &str,
    input: DepositInput,
    default_percent: u32,
) -> CoreResult<DepositRequest> {
    let request = with_retry("request_deposit", || {
        conn.immediate_transaction(|conn| {
            let estimate = load_estimate(conn, &ctx.tenant_id, estimate_id)?;
            let status = estimate.status()?;
            if status != EstimateStatus::Approved {
                return Err(CoreError::StateConflict {
                    entity: EstimateStatus::ENTITY,
                    status: status.as_str().to_string(),
                    action: "request deposit on",
                });
            }
            if estimate.deposit_requested {
                return Err(CoreError::StateConflict {
                    entity: EstimateStatus::ENTITY,
                    status: "deposit_requested".to_string(),
                    action: "request deposit on",
                });
            }

            let amount = deposit_amount(estimate.total, input.amount, input.percent, default_percent)?;
            let line = PricedLine {
                description: format!("Deposit for {}", estimate.estimate_number),
                quantity: 1.0,
                unit_price: amount,
                line_total: amount,
            };

            let deposit_invoice = insert_invoice_document(
                conn,
                NewInvoiceDocument {
                    tenant_id: estimate.tenant_id.clone(),
                    customer_id: estimate.customer_id.clone(),
                    job_id: estimate.job_id.clone(),
                    estimate_id: Some(estimate.id.clone()),
                    tax_rate_bps: 0,
                    totals: DocumentTotals {
                        subtotal: amount,
                        tax_amount: 0,
                        total: amount,
                    },
                    is_deposit: true,
                    notes: None,
                },
                std::slice::from_ref(&line),
            )?;

            let now = now_utc();
            let updated = diesel::update(
                estimates::table
                    .filter(estimates::tenant_id.eq(&ctx.tenant_id))
                    .filter(estimates::id.eq(&estimate.id))
                    .filter(estimates::deposit_requested.eq(false)),
            )
            .set((
                estimates::deposit_requested.eq(true),
                estimates::deposit_invoice_id.eq(Some(&deposit_invoice.invoice.id)),
                estimates::deposit_requested_at.eq(Some(now)),
                estimates::updated_at.eq(now),
            ))
            .execute(conn)?;
            if updated == 0 {
                return Err(CoreError::TransientConflict(format!(
                    "deposit on estimate {estimate_id} requested concurrently"
                )));
            }

            let estimate = load_estimate(conn, &ctx.tenant_id, estimate_id)?;
            Ok(DepositRequest { estimate, deposit_invoice })
        })
    })?;

    tracing::info!(
        tenant_id = %ctx.tenant_id,
        caller_id = %ctx.caller_id,
        caller_role = ctx.role.as_str(),
        estimate_id,
        invoice_id = %request.deposit_invoice.invoice.id,
        amount = request.deposit_invoice.invoice.total,
        "Deposit requested"
    );
    Ok(request)
}
