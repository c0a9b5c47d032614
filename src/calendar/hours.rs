//! Tenant business hours and slot generation.
//!
//! Hours are stored per weekday (`0` = Sunday) as minutes after local
//! midnight in the tenant's IANA timezone. A tenant with no rows gets
//! [`default_hours`]. Everything handed back to callers is UTC.

use chrono::{Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Weekday};
use chrono_tz::Tz;
use diesel::prelude::*;
use diesel::SqliteConnection;
use serde::{Deserialize, Serialize};

use crate::core::error::{CoreError, CoreResult};
use crate::core::shared::schema::business_hours;
use crate::core::shared::tenancy::tenant_timezone;

pub const DEFAULT_OPEN_MINUTE: i32 = 8 * 60;
pub const DEFAULT_CLOSE_MINUTE: i32 = 17 * 60;
pub const MINUTES_PER_DAY: i32 = 24 * 60;

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = business_hours)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct BusinessHoursRow {
    pub tenant_id: String,
    pub weekday: i32,
    pub open_minute: i32,
    pub close_minute: i32,
    pub is_closed: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DayHours {
    pub open_minute: i32,
    pub close_minute: i32,
}

/// Opening hours for one calendar day, resolved to UTC instants.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct OpenWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Slot {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

pub fn weekday_index(weekday: Weekday) -> i32 {
    weekday.num_days_from_sunday() as i32
}

/// Monday to Friday, 08:00 to 17:00.
pub fn default_hours(weekday: Weekday) -> Option<DayHours> {
    match weekday {
        Weekday::Sat | Weekday::Sun => None,
        _ => Some(DayHours {
            open_minute: DEFAULT_OPEN_MINUTE,
            close_minute: DEFAULT_CLOSE_MINUTE,
        }),
    }
}

/// `None` means closed. Tenants with no configured rows fall back to the
/// default schedule; tenants with some rows are closed on the missing days.
pub fn resolve_day_hours(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    weekday: Weekday,
) -> CoreResult<Option<DayHours>> {
    let rows: Vec<BusinessHoursRow> = business_hours::table
        .filter(business_hours::tenant_id.eq(tenant_id))
        .select(BusinessHoursRow::as_select())
        .load(conn)?;

    if rows.is_empty() {
        return Ok(default_hours(weekday));
    }

    let index = weekday_index(weekday);
    Ok(rows
        .into_iter()
        .find(|row| row.weekday == index)
        .filter(|row| !row.is_closed && row.close_minute > row.open_minute)
        .map(|row| DayHours {
            open_minute: row.open_minute,
            close_minute: row.close_minute,
        }))
}

/// Replace the tenant's weekly schedule. Days absent from `days` are closed.
pub fn set_business_hours(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    days: &[(Weekday, DayHours)],
) -> CoreResult<()> {
    for (weekday, hours) in days {
        validate_day_hours(*weekday, hours)?;
    }

    conn.immediate_transaction(|conn| {
        diesel::delete(business_hours::table.filter(business_hours::tenant_id.eq(tenant_id))).execute(conn)?;

        let rows: Vec<BusinessHoursRow> = (0..7)
            .map(|index| {
                let configured = days
                    .iter()
                    .find(|(weekday, _)| weekday_index(*weekday) == index)
                    .map(|(_, hours)| *hours);
                BusinessHoursRow {
                    tenant_id: tenant_id.to_string(),
                    weekday: index,
                    open_minute: configured.map_or(0, |h| h.open_minute),
                    close_minute: configured.map_or(0, |h| h.close_minute),
                    is_closed: configured.is_none(),
                }
            })
            .collect();

        diesel::insert_into(business_hours::table)
            .values(&rows)
            .execute(conn)?;
        Ok(())
    })
}

fn validate_day_hours(weekday: Weekday, hours: &DayHours) -> CoreResult<()> {
    let in_range = |m: i32| (0..=MINUTES_PER_DAY).contains(&m);
    if !in_range(hours.open_minute) || !in_range(hours.close_minute) || hours.close_minute <= hours.open_minute {
        return Err(CoreError::Validation(format!(
            "invalid hours for {weekday}: {}..{}",
            hours.open_minute, hours.close_minute
        )));
    }
    Ok(())
}

pub fn parse_timezone(name: &str) -> CoreResult<Tz> {
    name.parse::<Tz>()
        .map_err(|_| CoreError::Internal(format!("tenant has unknown timezone '{name}'")))
}

/// Local wall-clock time to UTC. Times inside a DST gap move forward to the
/// first valid instant; ambiguous times take the earlier one.
pub fn local_to_utc(tz: Tz, local: NaiveDateTime) -> CoreResult<NaiveDateTime> {
    let resolved = match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => (1..=4)
            .map(|step| local + Duration::minutes(30 * step))
            .find_map(|shifted| tz.from_local_datetime(&shifted).earliest()),
    };
    resolved
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| CoreError::Internal(format!("cannot resolve {local} in {tz}")))
}

pub fn open_window(tz: Tz, date: NaiveDate, hours: DayHours) -> CoreResult<OpenWindow> {
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| CoreError::Validation(format!("invalid date {date}")))?;
    let start = local_to_utc(tz, midnight + Duration::minutes(hours.open_minute as i64))?;
    let end = local_to_utc(tz, midnight + Duration::minutes(hours.close_minute as i64))?;
    Ok(OpenWindow { start, end })
}

/// The tenant's open window on `date`, or `None` when closed that day.
pub fn tenant_open_window(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    date: NaiveDate,
) -> CoreResult<Option<OpenWindow>> {
    let tz = parse_timezone(&tenant_timezone(conn, tenant_id)?)?;
    match resolve_day_hours(conn, tenant_id, date.weekday())? {
        Some(hours) => open_window(tz, date, hours).map(Some),
        None => Ok(None),
    }
}

/// Candidate slots every `step_minutes`, each `duration_minutes` long and
/// ending no later than the window end.
pub fn generate_slots(window: OpenWindow, duration_minutes: i64, step_minutes: i64) -> Vec<Slot> {
    if duration_minutes <= 0 || step_minutes <= 0 {
        return Vec::new();
    }
    let duration = Duration::minutes(duration_minutes);
    let step = Duration::minutes(step_minutes);

    let mut slots = Vec::new();
    let mut start = window.start;
    while start + duration <= window.end {
        slots.push(Slot {
            start,
            end: start + duration,
        });
        start += step;
    }
    slots
}

/// Half-open `[start, end)` overlap.
pub fn overlaps(a_start: NaiveDateTime, a_end: NaiveDateTime, b_start: NaiveDateTime, b_end: NaiveDateTime) -> bool {
    a_start < b_end && a_end > b_start
}
