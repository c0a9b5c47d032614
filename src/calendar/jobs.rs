use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::SqliteConnection;
use serde::{Deserialize, Serialize};

use crate::core::error::{CoreError, CoreResult};
use crate::core::shared::schema::jobs;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Scheduled,
    InProgress,
    Completed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable)]
#[diesel(table_name = jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Job {
    pub id: String,
    pub tenant_id: String,
    pub customer_id: String,
    pub title: String,
    pub status: String,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

pub fn get_job(conn: &mut SqliteConnection, tenant_id: &str, job_id: &str) -> CoreResult<Job> {
    jobs::table
        .filter(jobs::tenant_id.eq(tenant_id))
        .filter(jobs::id.eq(job_id))
        .select(Job::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| CoreError::not_found("job", job_id))
}

/// Copy an appointment's progress onto its job. Completed jobs are left
/// alone so a late confirm cannot pull them back to `scheduled`.
/// Returns whether a row changed.
pub fn mirror_job_status(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    job_id: &str,
    status: JobStatus,
    at: NaiveDateTime,
) -> CoreResult<bool> {
    let target = jobs::table
        .filter(jobs::tenant_id.eq(tenant_id))
        .filter(jobs::id.eq(job_id))
        .filter(jobs::status.ne(JobStatus::Completed.as_str()));

    let updated = match status {
        JobStatus::InProgress => diesel::update(target)
            .set((
                jobs::status.eq(status.as_str()),
                jobs::started_at.eq(Some(at)),
                jobs::updated_at.eq(at),
            ))
            .execute(conn)?,
        JobStatus::Completed => diesel::update(target)
            .set((
                jobs::status.eq(status.as_str()),
                jobs::completed_at.eq(Some(at)),
                jobs::updated_at.eq(at),
            ))
            .execute(conn)?,
        _ => diesel::update(target)
            .set((jobs::status.eq(status.as_str()), jobs::updated_at.eq(at)))
            .execute(conn)?,
    };

    if updated == 0 {
        tracing::debug!(tenant_id, job_id, status = status.as_str(), "Job status not mirrored");
    }
    Ok(updated > 0)
}
