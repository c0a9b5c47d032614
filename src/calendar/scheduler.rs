//! Appointment placement with per-technician conflict checks.
//!
//! Two live appointments for the same technician never overlap on the
//! half-open interval `[start, end)`. The overlap check and the write share
//! one immediate transaction, so a concurrent booking for the same window
//! waits for the first writer and then sees its row.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use diesel::prelude::*;
use diesel::SqliteConnection;
use serde::{Deserialize, Serialize};

use crate::attribution::{FunnelLinks, FunnelStage, FunnelSubject};
use crate::calendar::hours::{generate_slots, overlaps, tenant_open_window, Slot};
use crate::calendar::jobs::{get_job, JobStatus};
use crate::core::context::CallerContext;
use crate::core::effects::{Committed, SideEffect};
use crate::core::error::{ConflictingAppointment, CoreError, CoreResult};
use crate::core::lifecycle::{ensure_transition, parse_stored, Lifecycle};
use crate::core::shared::schema::appointments;
use crate::core::shared::tenancy::ensure_technician;
use crate::core::shared::utils::{new_id, now_utc, with_retry};
use crate::notifications::{TemplateKind, TemplateVars};

pub const DEFAULT_SLOT_STEP_MINUTES: i64 = 30;
const MAX_DURATION_MINUTES: i64 = 24 * 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    InProgress,
    Completed,
    NoShow,
    Canceled,
    Rescheduled,
}

const LIVE_NEXT: &[AppointmentStatus] = &[
    AppointmentStatus::Confirmed,
    AppointmentStatus::InProgress,
    AppointmentStatus::Canceled,
    AppointmentStatus::NoShow,
    AppointmentStatus::Rescheduled,
];

impl Lifecycle for AppointmentStatus {
    const ENTITY: &'static str = "appointment";

    fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Confirmed => "confirmed",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::NoShow => "no_show",
            Self::Canceled => "canceled",
            Self::Rescheduled => "rescheduled",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(Self::Scheduled),
            "confirmed" => Some(Self::Confirmed),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "no_show" => Some(Self::NoShow),
            "canceled" => Some(Self::Canceled),
            "rescheduled" => Some(Self::Rescheduled),
            _ => None,
        }
    }

    fn next_states(&self) -> &'static [Self] {
        match self {
            Self::Scheduled | Self::Confirmed | Self::Rescheduled => LIVE_NEXT,
            Self::InProgress => &[Self::Completed],
            Self::Completed | Self::NoShow | Self::Canceled => &[],
        }
    }
}

/// Status changes callers may request directly. Rescheduling has its own
/// operation because it moves the time window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentAction {
    Confirm,
    Start,
    Complete,
    Cancel,
    NoShow,
}

impl AppointmentAction {
    pub fn target(&self) -> AppointmentStatus {
        match self {
            Self::Confirm => AppointmentStatus::Confirmed,
            Self::Start => AppointmentStatus::InProgress,
            Self::Complete => AppointmentStatus::Completed,
            Self::Cancel => AppointmentStatus::Canceled,
            Self::NoShow => AppointmentStatus::NoShow,
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            Self::Confirm => "confirm",
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Cancel => "cancel",
            Self::NoShow => "mark no-show",
        }
    }

    fn mirrored_job_status(&self) -> Option<JobStatus> {
        match self {
            Self::Confirm => Some(JobStatus::Scheduled),
            Self::Start => Some(JobStatus::InProgress),
            Self::Complete => Some(JobStatus::Completed),
            Self::Cancel | Self::NoShow => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = appointments)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Appointment {
    pub id: String,
    pub tenant_id: String,
    pub job_id: String,
    pub customer_id: String,
    pub technician_id: Option<String>,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub status: String,
    pub notes: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Appointment {
    pub fn status(&self) -> CoreResult<AppointmentStatus> {
        parse_stored(&self.status)
    }

    pub fn duration(&self) -> Duration {
        self.end_time - self.start_time
    }
}

impl From<&Appointment> for ConflictingAppointment {
    fn from(appt: &Appointment) -> Self {
        Self {
            id: appt.id.clone(),
            technician_id: appt.technician_id.clone(),
            start_time: appt.start_time,
            end_time: appt.end_time,
            status: appt.status.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AvailabilityQuery {
    pub date: NaiveDate,
    pub technician_id: Option<String>,
    pub duration_minutes: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Availability {
    pub date: NaiveDate,
    pub technician_id: Option<String>,
    pub duration_minutes: i64,
    pub slots: Vec<Slot>,
    pub closed_reason: Option<String>,
}

/// Times are UTC. Either `end_time` or `duration_minutes` must be given.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateAppointmentInput {
    pub job_id: String,
    pub technician_id: Option<String>,
    pub start_time: NaiveDateTime,
    pub end_time: Option<NaiveDateTime>,
    pub duration_minutes: Option<i64>,
    pub notes: Option<String>,
}

/// Without `end_time` the original duration is kept.
#[derive(Debug, Clone, Deserialize)]
pub struct RescheduleInput {
    pub start_time: NaiveDateTime,
    pub end_time: Option<NaiveDateTime>,
    pub reason: Option<String>,
}

fn validate_duration(minutes: i64) -> CoreResult<()> {
    if minutes <= 0 || minutes > MAX_DURATION_MINUTES {
        return Err(CoreError::Validation(format!(
            "duration must be between 1 and {MAX_DURATION_MINUTES} minutes, got {minutes}"
        )));
    }
    Ok(())
}

fn validate_window(start: NaiveDateTime, end: NaiveDateTime) -> CoreResult<()> {
    if end <= start {
        return Err(CoreError::Validation(format!(
            "appointment must end after it starts ({start} .. {end})"
        )));
    }
    validate_duration((end - start).num_minutes().max(1))
}

pub fn load_appointment(conn: &mut SqliteConnection, tenant_id: &str, appointment_id: &str) -> CoreResult<Appointment> {
    appointments::table
        .filter(appointments::tenant_id.eq(tenant_id))
        .filter(appointments::id.eq(appointment_id))
        .select(Appointment::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| CoreError::not_found("appointment", appointment_id))
}

pub fn get_appointment(conn: &mut SqliteConnection, ctx: &CallerContext, appointment_id: &str) -> CoreResult<Appointment> {
    load_appointment(conn, &ctx.tenant_id, appointment_id)
}

/// Live (non-canceled) bookings intersecting `[start, end)`, optionally for
/// one technician.
fn bookings_in_window(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    technician_id: Option<&str>,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> CoreResult<Vec<Appointment>> {
    let mut query = appointments::table
        .filter(appointments::tenant_id.eq(tenant_id))
        .filter(appointments::status.ne(AppointmentStatus::Canceled.as_str()))
        .filter(appointments::start_time.lt(end))
        .filter(appointments::end_time.gt(start))
        .into_boxed();
    if let Some(technician_id) = technician_id {
        query = query.filter(appointments::technician_id.eq(technician_id));
    }
    Ok(query
        .order(appointments::start_time.asc())
        .select(Appointment::as_select())
        .load(conn)?)
}

/// First live booking of `technician_id` overlapping `[start, end)`,
/// ignoring `exclude_id`.
pub fn find_conflict(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    technician_id: &str,
    start: NaiveDateTime,
    end: NaiveDateTime,
    exclude_id: Option<&str>,
) -> CoreResult<Option<Appointment>> {
    let bookings = bookings_in_window(conn, tenant_id, Some(technician_id), start, end)?;
    Ok(bookings
        .into_iter()
        .filter(|appt| Some(appt.id.as_str()) != exclude_id)
        .find(|appt| overlaps(start, end, appt.start_time, appt.end_time)))
}

fn reject_on_conflict(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    technician_id: Option<&str>,
    start: NaiveDateTime,
    end: NaiveDateTime,
    exclude_id: Option<&str>,
) -> CoreResult<()> {
    let Some(technician_id) = technician_id else {
        return Ok(());
    };
    match find_conflict(conn, tenant_id, technician_id, start, end, exclude_id)? {
        Some(existing) => {
            tracing::info!(
                tenant_id,
                technician_id,
                conflicting_id = %existing.id,
                requested_start = %start,
                requested_end = %end,
                "Appointment conflict"
            );
            Err(CoreError::AppointmentConflict {
                conflicting: ConflictingAppointment::from(&existing),
            })
        }
        None => Ok(()),
    }
}

/// Open slots on `query.date`. Without a technician every live booking in
/// the tenant blocks a slot.
pub fn check_availability(
    conn: &mut SqliteConnection,
    ctx: &CallerContext,
    query: &AvailabilityQuery,
    step_minutes: i64,
) -> CoreResult<Availability> {
    validate_duration(query.duration_minutes)?;
    if let Some(technician_id) = &query.technician_id {
        ensure_technician(conn, &ctx.tenant_id, technician_id)?;
    }

    let mut availability = Availability {
        date: query.date,
        technician_id: query.technician_id.clone(),
        duration_minutes: query.duration_minutes,
        slots: Vec::new(),
        closed_reason: None,
    };

    let Some(window) = tenant_open_window(conn, &ctx.tenant_id, query.date)? else {
        availability.closed_reason = Some(format!("closed on {}", query.date.weekday()));
        return Ok(availability);
    };

    let bookings = bookings_in_window(
        conn,
        &ctx.tenant_id,
        query.technician_id.as_deref(),
        window.start,
        window.end,
    )?;

    let step = if step_minutes > 0 {
        step_minutes
    } else {
        DEFAULT_SLOT_STEP_MINUTES
    };
    availability.slots = generate_slots(window, query.duration_minutes, step)
        .into_iter()
        .filter(|slot| {
            !bookings
                .iter()
                .any(|appt| overlaps(slot.start, slot.end, appt.start_time, appt.end_time))
        })
        .collect();
    Ok(availability)
}

fn appointment_vars(appt: &Appointment) -> TemplateVars {
    let mut variables = TemplateVars::new();
    variables.insert("appointment_id".to_string(), appt.id.clone());
    variables.insert("start_time".to_string(), appt.start_time.format("%Y-%m-%dT%H:%M:%SZ").to_string());
    variables.insert("end_time".to_string(), appt.end_time.format("%Y-%m-%dT%H:%M:%SZ").to_string());
    variables
}

pub fn create_appointment(
    conn: &mut SqliteConnection,
    ctx: &CallerContext,
    input: CreateAppointmentInput,
) -> CoreResult<Committed<Appointment>> {
    let end_time = match (input.end_time, input.duration_minutes) {
        (Some(end), _) => end,
        (None, Some(minutes)) => {
            validate_duration(minutes)?;
            input.start_time + Duration::minutes(minutes)
        }
        (None, None) => {
            return Err(CoreError::Validation(
                "either end_time or duration_minutes is required".to_string(),
            ))
        }
    };
    validate_window(input.start_time, end_time)?;

    let appointment = with_retry("create_appointment", || {
        conn.immediate_transaction(|conn| {
            let job = get_job(conn, &ctx.tenant_id, &input.job_id)?;
            if let Some(technician_id) = &input.technician_id {
                ensure_technician(conn, &ctx.tenant_id, technician_id)?;
            }
            reject_on_conflict(
                conn,
                &ctx.tenant_id,
                input.technician_id.as_deref(),
                input.start_time,
                end_time,
                None,
            )?;

            let now = now_utc();
            let appointment = Appointment {
                id: new_id(),
                tenant_id: ctx.tenant_id.clone(),
                job_id: job.id,
                customer_id: job.customer_id,
                technician_id: input.technician_id.clone(),
                start_time: input.start_time,
                end_time,
                status: AppointmentStatus::Scheduled.as_str().to_string(),
                notes: input.notes.clone(),
                created_at: now,
                updated_at: now,
            };
            diesel::insert_into(appointments::table)
                .values(&appointment)
                .execute(conn)?;
            Ok(appointment)
        })
    })?;

    tracing::info!(
        tenant_id = %ctx.tenant_id,
        caller_id = %ctx.caller_id,
        caller_role = ctx.role.as_str(),
        appointment_id = %appointment.id,
        job_id = %appointment.job_id,
        technician_id = appointment.technician_id.as_deref().unwrap_or("-"),
        start = %appointment.start_time,
        end = %appointment.end_time,
        "Appointment created"
    );

    let effects = vec![
        SideEffect::MirrorJobStatus {
            tenant_id: appointment.tenant_id.clone(),
            job_id: appointment.job_id.clone(),
            status: JobStatus::Scheduled,
            at: appointment.created_at,
        },
        SideEffect::AdvanceFunnel {
            tenant_id: appointment.tenant_id.clone(),
            subject: FunnelSubject::Job(appointment.job_id.clone()),
            stage: FunnelStage::JobScheduled,
            value: None,
            links: FunnelLinks::new(Some(appointment.customer_id.clone()), Some(appointment.job_id.clone())),
        },
        SideEffect::Notify {
            tenant_id: appointment.tenant_id.clone(),
            customer_id: appointment.customer_id.clone(),
            template: TemplateKind::AppointmentScheduled,
            variables: appointment_vars(&appointment),
        },
    ];
    Ok(Committed::new(appointment).with_all(effects))
}

fn append_note(existing: Option<&str>, addition: &str) -> String {
    match existing.map(str::trim_end).filter(|n| !n.is_empty()) {
        Some(notes) => format!("{notes}\n{addition}"),
        None => addition.to_string(),
    }
}

pub fn reschedule_appointment(
    conn: &mut SqliteConnection,
    ctx: &CallerContext,
    appointment_id: &str,
    input: RescheduleInput,
) -> CoreResult<Committed<Appointment>> {
    let appointment = with_retry("reschedule_appointment", || {
        conn.immediate_transaction(|conn| {
            let current = load_appointment(conn, &ctx.tenant_id, appointment_id)?;
            ensure_transition(current.status()?, AppointmentStatus::Rescheduled, "reschedule")?;

            let start_time = input.start_time;
            let end_time = input.end_time.unwrap_or(start_time + current.duration());
            validate_window(start_time, end_time)?;
            reject_on_conflict(
                conn,
                &ctx.tenant_id,
                current.technician_id.as_deref(),
                start_time,
                end_time,
                Some(&current.id),
            )?;

            let notes = match input.reason.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
                Some(reason) => Some(append_note(current.notes.as_deref(), &format!("Rescheduled: {reason}"))),
                None => current.notes.clone(),
            };

            diesel::update(
                appointments::table
                    .filter(appointments::tenant_id.eq(&ctx.tenant_id))
                    .filter(appointments::id.eq(&current.id)),
            )
            .set((
                appointments::start_time.eq(start_time),
                appointments::end_time.eq(end_time),
                appointments::status.eq(AppointmentStatus::Rescheduled.as_str()),
                appointments::notes.eq(notes),
                appointments::updated_at.eq(now_utc()),
            ))
            .execute(conn)?;

            load_appointment(conn, &ctx.tenant_id, appointment_id)
        })
    })?;

    tracing::info!(
        tenant_id = %ctx.tenant_id,
        caller_id = %ctx.caller_id,
        caller_role = ctx.role.as_str(),
        appointment_id,
        start = %appointment.start_time,
        end = %appointment.end_time,
        "Appointment rescheduled"
    );

    let notify = SideEffect::Notify {
        tenant_id: appointment.tenant_id.clone(),
        customer_id: appointment.customer_id.clone(),
        template: TemplateKind::AppointmentRescheduled,
        variables: appointment_vars(&appointment),
    };
    Ok(Committed::new(appointment).with(notify))
}

pub fn update_status(
    conn: &mut SqliteConnection,
    ctx: &CallerContext,
    appointment_id: &str,
    action: AppointmentAction,
) -> CoreResult<Committed<Appointment>> {
    let next = action.target();
    let appointment = with_retry("update_appointment_status", || {
        conn.immediate_transaction(|conn| {
            let current = load_appointment(conn, &ctx.tenant_id, appointment_id)?;
            ensure_transition(current.status()?, next, action.verb())?;

            diesel::update(
                appointments::table
                    .filter(appointments::tenant_id.eq(&ctx.tenant_id))
                    .filter(appointments::id.eq(&current.id)),
            )
            .set((
                appointments::status.eq(next.as_str()),
                appointments::updated_at.eq(now_utc()),
            ))
            .execute(conn)?;

            load_appointment(conn, &ctx.tenant_id, appointment_id)
        })
    })?;

    tracing::info!(
        tenant_id = %ctx.tenant_id,
        caller_id = %ctx.caller_id,
        caller_role = ctx.role.as_str(),
        appointment_id,
        status = next.as_str(),
        "Appointment status changed"
    );

    let mut effects = Vec::new();
    if let Some(job_status) = action.mirrored_job_status() {
        effects.push(SideEffect::MirrorJobStatus {
            tenant_id: appointment.tenant_id.clone(),
            job_id: appointment.job_id.clone(),
            status: job_status,
            at: appointment.updated_at,
        });
    }
    if action == AppointmentAction::Complete {
        effects.push(SideEffect::AdvanceFunnel {
            tenant_id: appointment.tenant_id.clone(),
            subject: FunnelSubject::Job(appointment.job_id.clone()),
            stage: FunnelStage::JobCompleted,
            value: None,
            links: FunnelLinks::new(Some(appointment.customer_id.clone()), Some(appointment.job_id.clone())),
        });
    }
    Ok(Committed::new(appointment).with_all(effects))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_statuses_can_be_rescheduled() {
        for status in [
            AppointmentStatus::Scheduled,
            AppointmentStatus::Confirmed,
            AppointmentStatus::Rescheduled,
        ] {
            assert!(status.can_transition_to(AppointmentStatus::Rescheduled));
            assert!(status.can_transition_to(AppointmentStatus::Canceled));
        }
    }

    #[test]
    fn test_in_progress_only_completes() {
        assert_eq!(
            AppointmentStatus::InProgress.next_states(),
            &[AppointmentStatus::Completed]
        );
        assert!(!AppointmentStatus::InProgress.can_transition_to(AppointmentStatus::Canceled));
    }

    #[test]
    fn test_finished_statuses_are_terminal() {
        assert!(AppointmentStatus::Completed.is_terminal());
        assert!(AppointmentStatus::Canceled.is_terminal());
        assert!(AppointmentStatus::NoShow.is_terminal());
        assert!(!AppointmentStatus::Scheduled.is_terminal());
    }

    #[test]
    fn test_action_targets_and_mirroring() {
        assert_eq!(AppointmentAction::Start.target(), AppointmentStatus::InProgress);
        assert_eq!(AppointmentAction::Start.mirrored_job_status(), Some(JobStatus::InProgress));
        assert_eq!(AppointmentAction::Complete.mirrored_job_status(), Some(JobStatus::Completed));
        assert_eq!(AppointmentAction::Cancel.mirrored_job_status(), None);
    }

    #[test]
    fn test_append_note_keeps_existing_text() {
        assert_eq!(append_note(None, "Rescheduled: rain"), "Rescheduled: rain");
        assert_eq!(append_note(Some(""), "Rescheduled: rain"), "Rescheduled: rain");
        assert_eq!(
            append_note(Some("Gate code 1234"), "Rescheduled: rain"),
            "Gate code 1234\nRescheduled: rain"
        );
    }

    #[test]
    fn test_status_round_trips_through_storage_names() {
        for status in [
            AppointmentStatus::Scheduled,
            AppointmentStatus::Confirmed,
            AppointmentStatus::InProgress,
            AppointmentStatus::Completed,
            AppointmentStatus::NoShow,
            AppointmentStatus::Canceled,
            AppointmentStatus::Rescheduled,
        ] {
            assert_eq!(AppointmentStatus::parse(status.as_str()), Some(status));
        }
    }
}
