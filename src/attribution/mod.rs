//! Call-to-revenue funnel tracking.
//!
//! One record follows a lead from the inbound call to collected payment.
//! Updates are telemetry: a missing record or an out-of-order advance is a
//! logged no-op and never fails the operation that triggered it. Linkage
//! (`customer_id`, `job_id`) is first-writer-wins; the stage is
//! last-writer-wins but may only move forward or to `lost`.

pub mod api;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::SqliteConnection;
use serde::{Deserialize, Serialize};

use crate::core::error::{CoreError, CoreResult};
use crate::core::lifecycle::{parse_stored, Lifecycle};
use crate::core::shared::schema::attribution_records;
use crate::core::shared::utils::{new_id, now_utc};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FunnelStage {
    CallReceived,
    LeadCreated,
    QuoteSent,
    QuoteApproved,
    JobScheduled,
    JobCompleted,
    PaymentCollected,
    Lost,
}

/// Stages that end a record; a new call opens a new one.
pub const CLOSED_STAGES: [&str; 2] = ["payment_collected", "lost"];

impl FunnelStage {
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::CallReceived => 0,
            Self::LeadCreated => 1,
            Self::QuoteSent => 2,
            Self::QuoteApproved => 3,
            Self::JobScheduled => 4,
            Self::JobCompleted => 5,
            Self::PaymentCollected => 6,
            Self::Lost => u8::MAX,
        }
    }
}

impl Lifecycle for FunnelStage {
    const ENTITY: &'static str = "attribution record";

    fn as_str(&self) -> &'static str {
        match self {
            Self::CallReceived => "call_received",
            Self::LeadCreated => "lead_created",
            Self::QuoteSent => "quote_sent",
            Self::QuoteApproved => "quote_approved",
            Self::JobScheduled => "job_scheduled",
            Self::JobCompleted => "job_completed",
            Self::PaymentCollected => "payment_collected",
            Self::Lost => "lost",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "call_received" => Some(Self::CallReceived),
            "lead_created" => Some(Self::LeadCreated),
            "quote_sent" => Some(Self::QuoteSent),
            "quote_approved" => Some(Self::QuoteApproved),
            "job_scheduled" => Some(Self::JobScheduled),
            "job_completed" => Some(Self::JobCompleted),
            "payment_collected" => Some(Self::PaymentCollected),
            "lost" => Some(Self::Lost),
            _ => None,
        }
    }

    // Any later stage, or lost. Skipping ahead is normal: a lead can be
    // scheduled without a quote.
    fn next_states(&self) -> &'static [Self] {
        use FunnelStage::*;
        match self {
            CallReceived => &[LeadCreated, QuoteSent, QuoteApproved, JobScheduled, JobCompleted, PaymentCollected, Lost],
            LeadCreated => &[QuoteSent, QuoteApproved, JobScheduled, JobCompleted, PaymentCollected, Lost],
            QuoteSent => &[QuoteApproved, JobScheduled, JobCompleted, PaymentCollected, Lost],
            QuoteApproved => &[JobScheduled, JobCompleted, PaymentCollected, Lost],
            JobScheduled => &[JobCompleted, PaymentCollected, Lost],
            JobCompleted => &[PaymentCollected, Lost],
            PaymentCollected | Lost => &[],
        }
    }
}

/// How a funnel update finds its record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum FunnelSubject {
    Call(String),
    Job(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunnelLinks {
    pub customer_id: Option<String>,
    pub job_id: Option<String>,
}

impl FunnelLinks {
    pub fn new(customer_id: Option<String>, job_id: Option<String>) -> Self {
        Self { customer_id, job_id }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = attribution_records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(treat_none_as_null = true)]
pub struct AttributionRecord {
    pub id: String,
    pub tenant_id: String,
    pub call_id: String,
    pub customer_id: Option<String>,
    pub job_id: Option<String>,
    pub stage: String,
    pub stage_changed_at: NaiveDateTime,
    pub estimated_value: Option<i64>,
    pub actual_value: Option<i64>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl AttributionRecord {
    pub fn stage(&self) -> CoreResult<FunnelStage> {
        parse_stored(&self.stage)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    Advanced { record: AttributionRecord },
    /// Same stage again; only linkage and value were filled in.
    Unchanged { record: AttributionRecord },
    Ignored {
        record_id: String,
        current: FunnelStage,
        requested: FunnelStage,
    },
    NoOpenRecord,
}

fn find_open(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    subject: &FunnelSubject,
) -> CoreResult<Option<AttributionRecord>> {
    let mut query = attribution_records::table
        .filter(attribution_records::tenant_id.eq(tenant_id))
        .filter(attribution_records::stage.ne_all(CLOSED_STAGES))
        .order(attribution_records::created_at.desc())
        .select(AttributionRecord::as_select())
        .into_boxed();

    query = match subject {
        FunnelSubject::Call(call_id) => query.filter(attribution_records::call_id.eq(call_id.clone())),
        FunnelSubject::Job(job_id) => query.filter(attribution_records::job_id.eq(job_id.clone())),
    };

    Ok(query.first(conn).optional()?)
}

/// Open a funnel record for an inbound call. Calling again for a call that
/// still has an open record returns that record unchanged.
pub fn record_call(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    call_id: &str,
    customer_id: Option<String>,
    estimated_value: Option<i64>,
) -> CoreResult<AttributionRecord> {
    if call_id.trim().is_empty() {
        return Err(CoreError::Validation("call_id is required".to_string()));
    }

    conn.immediate_transaction(|conn| {
        let subject = FunnelSubject::Call(call_id.to_string());
        if let Some(existing) = find_open(conn, tenant_id, &subject)? {
            tracing::debug!(tenant_id, call_id, record_id = %existing.id, "Call already has an open funnel record");
            return Ok(existing);
        }

        let now = now_utc();
        let record = AttributionRecord {
            id: new_id(),
            tenant_id: tenant_id.to_string(),
            call_id: call_id.to_string(),
            customer_id,
            job_id: None,
            stage: FunnelStage::CallReceived.as_str().to_string(),
            stage_changed_at: now,
            estimated_value,
            actual_value: None,
            created_at: now,
            updated_at: now,
        };

        diesel::insert_into(attribution_records::table)
            .values(&record)
            .execute(conn)?;

        tracing::info!(tenant_id, call_id, record_id = %record.id, "Funnel record opened");
        Ok(record)
    })
}

pub fn advance_stage(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    subject: &FunnelSubject,
    stage: FunnelStage,
    value: Option<i64>,
    links: &FunnelLinks,
) -> CoreResult<AdvanceOutcome> {
    conn.immediate_transaction(|conn| {
        let Some(mut record) = find_open(conn, tenant_id, subject)? else {
            tracing::debug!(tenant_id, ?subject, stage = stage.as_str(), "No open funnel record");
            return Ok(AdvanceOutcome::NoOpenRecord);
        };

        let current = record.stage()?;
        let moves = current.can_transition_to(stage);
        if !moves && current != stage {
            tracing::info!(
                tenant_id,
                record_id = %record.id,
                current = current.as_str(),
                requested = stage.as_str(),
                "Ignoring funnel regression"
            );
            return Ok(AdvanceOutcome::Ignored {
                record_id: record.id,
                current,
                requested: stage,
            });
        }

        let now = now_utc();
        if record.customer_id.is_none() {
            record.customer_id = links.customer_id.clone();
        }
        if record.job_id.is_none() {
            record.job_id = links.job_id.clone();
        }
        if let Some(amount) = value {
            if stage == FunnelStage::PaymentCollected {
                record.actual_value = Some(amount);
            } else {
                record.estimated_value = Some(amount);
            }
        }
        if moves {
            record.stage = stage.as_str().to_string();
            record.stage_changed_at = now;
        }
        record.updated_at = now;

        diesel::update(attribution_records::table.filter(attribution_records::id.eq(&record.id)))
            .set(&record)
            .execute(conn)?;

        if moves {
            tracing::info!(
                tenant_id,
                record_id = %record.id,
                from = current.as_str(),
                to = stage.as_str(),
                "Funnel stage advanced"
            );
            Ok(AdvanceOutcome::Advanced { record })
        } else {
            Ok(AdvanceOutcome::Unchanged { record })
        }
    })
}

pub fn mark_lost(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    subject: &FunnelSubject,
) -> CoreResult<AdvanceOutcome> {
    advance_stage(conn, tenant_id, subject, FunnelStage::Lost, None, &FunnelLinks::default())
}

pub fn get_record(conn: &mut SqliteConnection, tenant_id: &str, id: &str) -> CoreResult<AttributionRecord> {
    attribution_records::table
        .filter(attribution_records::tenant_id.eq(tenant_id))
        .filter(attribution_records::id.eq(id))
        .select(AttributionRecord::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| CoreError::not_found("attribution record", id))
}
