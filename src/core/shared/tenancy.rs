//! Tenant-scoped existence checks. A reference to a row owned by another
//! tenant is reported exactly like a missing row.

use diesel::prelude::*;
use diesel::SqliteConnection;

use crate::calendar::jobs::{get_job, Job};
use crate::core::error::{CoreError, CoreResult};
use crate::core::shared::schema::{customers, technicians, tenants};

pub fn ensure_customer(conn: &mut SqliteConnection, tenant_id: &str, customer_id: &str) -> CoreResult<()> {
    let found: Option<String> = customers::table
        .filter(customers::tenant_id.eq(tenant_id))
        .filter(customers::id.eq(customer_id))
        .select(customers::id)
        .first(conn)
        .optional()?;
    found
        .map(|_| ())
        .ok_or_else(|| CoreError::not_found("customer", customer_id))
}

/// The job must exist in the tenant and belong to `customer_id`.
pub fn ensure_job_for_customer(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    job_id: &str,
    customer_id: &str,
) -> CoreResult<Job> {
    let job = get_job(conn, tenant_id, job_id)?;
    if job.customer_id != customer_id {
        return Err(CoreError::Validation(format!(
            "job {job_id} does not belong to customer {customer_id}"
        )));
    }
    Ok(job)
}

pub fn ensure_technician(conn: &mut SqliteConnection, tenant_id: &str, technician_id: &str) -> CoreResult<()> {
    let active: Option<bool> = technicians::table
        .filter(technicians::tenant_id.eq(tenant_id))
        .filter(technicians::id.eq(technician_id))
        .select(technicians::is_active)
        .first(conn)
        .optional()?;
    match active {
        Some(true) => Ok(()),
        Some(false) => Err(CoreError::Validation(format!(
            "technician {technician_id} is inactive"
        ))),
        None => Err(CoreError::not_found("technician", technician_id)),
    }
}

pub fn tenant_timezone(conn: &mut SqliteConnection, tenant_id: &str) -> CoreResult<String> {
    tenants::table
        .filter(tenants::id.eq(tenant_id))
        .select(tenants::timezone)
        .first(conn)
        .optional()?
        .ok_or_else(|| CoreError::not_found("tenant", tenant_id))
}
