//! Per-tenant document numbering (`EST-001`, `INV-042`, ...).
//!
//! There is no counter row. The next number is derived from the highest
//! number already stored for the tenant and document kind, so [`allocate`]
//! must run inside the same `BEGIN IMMEDIATE` transaction as the insert that
//! uses its result. The unique `(tenant_id, *_number)` index is the last line:
//! a collision surfaces as a transient conflict and the caller retries the
//! whole create.

use diesel::prelude::*;
use diesel::SqliteConnection;
use serde::{Deserialize, Serialize};

use crate::core::error::CoreResult;
use crate::core::shared::schema::{estimates, invoices};

pub const MIN_DIGITS: usize = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Estimate,
    Invoice,
}

impl DocumentKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Estimate => "EST",
            Self::Invoice => "INV",
        }
    }
}

pub fn format_number(kind: DocumentKind, sequence: u64) -> String {
    format!("{}-{:0width$}", kind.prefix(), sequence, width = MIN_DIGITS)
}

/// Numeric suffix of a well-formed number, `None` for anything else.
pub fn parse_number(kind: DocumentKind, number: &str) -> Option<u64> {
    let digits = number
        .strip_prefix(kind.prefix())
        .and_then(|rest| rest.strip_prefix('-'))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Next number given every number already issued. Malformed legacy values
/// are skipped rather than restarting the sequence, which could otherwise
/// reissue `PREFIX-001`.
pub fn next_number<'a, I>(kind: DocumentKind, existing: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut skipped = 0usize;
    let highest = existing
        .into_iter()
        .filter_map(|number| {
            let parsed = parse_number(kind, number);
            if parsed.is_none() {
                skipped += 1;
            }
            parsed
        })
        .max();

    if skipped > 0 {
        tracing::warn!(
            prefix = kind.prefix(),
            skipped,
            "Ignoring malformed document numbers while allocating"
        );
    }

    format_number(kind, highest.map_or(1, |n| n.saturating_add(1)))
}

pub fn allocate(conn: &mut SqliteConnection, tenant_id: &str, kind: DocumentKind) -> CoreResult<String> {
    let pattern = format!("{}-%", kind.prefix());
    let existing: Vec<String> = match kind {
        DocumentKind::Estimate => estimates::table
            .filter(estimates::tenant_id.eq(tenant_id))
            .filter(estimates::estimate_number.like(&pattern))
            .select(estimates::estimate_number)
            .load(conn)?,
        DocumentKind::Invoice => invoices::table
            .filter(invoices::tenant_id.eq(tenant_id))
            .filter(invoices::invoice_number.like(&pattern))
            .select(invoices::invoice_number)
            .load(conn)?,
    };

    Ok(next_number(kind, existing.iter().map(String::as_str)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_number() {
        let none: [&str; 0] = [];
        assert_eq!(next_number(DocumentKind::Estimate, none), "EST-001");
        assert_eq!(next_number(DocumentKind::Invoice, none), "INV-001");
    }

    #[test]
    fn test_increments_highest_not_latest() {
        let existing = ["INV-007", "INV-012", "INV-009"];
        assert_eq!(next_number(DocumentKind::Invoice, existing), "INV-013");
    }

    #[test]
    fn test_grows_past_three_digits() {
        assert_eq!(next_number(DocumentKind::Estimate, ["EST-999"]), "EST-1000");
        assert_eq!(
            next_number(DocumentKind::Estimate, ["EST-999", "EST-1000"]),
            "EST-1001"
        );
    }

    #[test]
    fn test_malformed_numbers_are_skipped() {
        let existing = ["EST-004", "EST-4B", "legacy-17", "EST-"];
        assert_eq!(next_number(DocumentKind::Estimate, existing), "EST-005");
        assert_eq!(next_number(DocumentKind::Estimate, ["EST-X1"]), "EST-001");
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(DocumentKind::Estimate, "EST-042"), Some(42));
        assert_eq!(parse_number(DocumentKind::Estimate, "INV-042"), None);
        assert_eq!(parse_number(DocumentKind::Invoice, "INV-+42"), None);
        assert_eq!(parse_number(DocumentKind::Invoice, "INV042"), None);
    }
}
