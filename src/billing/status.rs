use serde::{Deserialize, Serialize};

use crate::core::lifecycle::Lifecycle;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EstimateStatus {
    Draft,
    Sent,
    Approved,
    Declined,
    Voided,
    Converted,
}

impl Lifecycle for EstimateStatus {
    const ENTITY: &'static str = "estimate";

    fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Sent => "sent",
            Self::Approved => "approved",
            Self::Declined => "declined",
            Self::Voided => "voided",
            Self::Converted => "converted",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "sent" => Some(Self::Sent),
            "approved" => Some(Self::Approved),
            "declined" => Some(Self::Declined),
            "voided" => Some(Self::Voided),
            "converted" => Some(Self::Converted),
            _ => None,
        }
    }

    // Approved estimates can no longer be voided; they either convert or sit.
    fn next_states(&self) -> &'static [Self] {
        match self {
            Self::Draft => &[Self::Sent, Self::Approved, Self::Voided],
            Self::Sent => &[Self::Approved, Self::Declined, Self::Voided],
            Self::Declined => &[Self::Voided],
            Self::Approved => &[Self::Converted],
            Self::Voided | Self::Converted => &[],
        }
    }
}

impl EstimateStatus {
    /// Only drafts accept edits to line items, tax rate or notes.
    pub fn is_editable(&self) -> bool {
        matches!(self, Self::Draft)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Viewed,
    Partial,
    Paid,
    Overdue,
    Void,
}

impl Lifecycle for InvoiceStatus {
    const ENTITY: &'static str = "invoice";

    fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Sent => "sent",
            Self::Viewed => "viewed",
            Self::Partial => "partial",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
            Self::Void => "void",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "sent" => Some(Self::Sent),
            "viewed" => Some(Self::Viewed),
            "partial" => Some(Self::Partial),
            "paid" => Some(Self::Paid),
            "overdue" => Some(Self::Overdue),
            "void" => Some(Self::Void),
            _ => None,
        }
    }

    // viewed and overdue are informational markers; the only hard rules are
    // that paid and void are terminal.
    fn next_states(&self) -> &'static [Self] {
        match self {
            Self::Draft => &[Self::Sent, Self::Viewed, Self::Partial, Self::Paid, Self::Void],
            Self::Sent => &[Self::Viewed, Self::Partial, Self::Paid, Self::Overdue, Self::Void],
            Self::Viewed => &[Self::Partial, Self::Paid, Self::Overdue, Self::Void],
            Self::Overdue => &[Self::Partial, Self::Paid, Self::Void],
            Self::Partial => &[Self::Partial, Self::Paid, Self::Overdue, Self::Void],
            Self::Paid | Self::Void => &[],
        }
    }
}

impl InvoiceStatus {
    /// Status after a successful payment brings the accumulator to `paid_amount`.
    pub fn after_payment(paid_amount: i64, total: i64) -> Self {
        if paid_amount >= total {
            Self::Paid
        } else {
            Self::Partial
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Succeeded,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Check,
    Card,
    BankTransfer,
    Other,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::Check => "check",
            Self::Card => "card",
            Self::BankTransfer => "bank_transfer",
            Self::Other => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::CoreError;
    use crate::core::lifecycle::ensure_transition;

    #[test]
    fn test_send_requires_draft() {
        assert!(ensure_transition(EstimateStatus::Draft, EstimateStatus::Sent, "send").is_ok());
        for from in [
            EstimateStatus::Sent,
            EstimateStatus::Approved,
            EstimateStatus::Declined,
            EstimateStatus::Voided,
            EstimateStatus::Converted,
        ] {
            assert!(
                ensure_transition(from, EstimateStatus::Sent, "send").is_err(),
                "{from:?} -> sent"
            );
        }
    }

    #[test]
    fn test_void_rejected_for_voided_converted_approved() {
        for from in [
            EstimateStatus::Voided,
            EstimateStatus::Converted,
            EstimateStatus::Approved,
        ] {
            let err = ensure_transition(from, EstimateStatus::Voided, "void").unwrap_err();
            assert!(matches!(err, CoreError::StateConflict { entity: "estimate", .. }));
        }
        assert!(ensure_transition(EstimateStatus::Sent, EstimateStatus::Voided, "void").is_ok());
    }

    #[test]
    fn test_only_approved_converts() {
        assert!(EstimateStatus::Approved.can_transition_to(EstimateStatus::Converted));
        assert!(!EstimateStatus::Sent.can_transition_to(EstimateStatus::Converted));
        assert!(!EstimateStatus::Draft.can_transition_to(EstimateStatus::Converted));
    }

    #[test]
    fn test_paid_and_void_invoices_are_terminal() {
        assert!(InvoiceStatus::Paid.is_terminal());
        assert!(InvoiceStatus::Void.is_terminal());
        assert!(!InvoiceStatus::Paid.can_transition_to(InvoiceStatus::Void));
        assert!(InvoiceStatus::Partial.can_transition_to(InvoiceStatus::Void));
        assert!(InvoiceStatus::Partial.can_transition_to(InvoiceStatus::Partial));
    }

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            InvoiceStatus::Draft,
            InvoiceStatus::Sent,
            InvoiceStatus::Viewed,
            InvoiceStatus::Partial,
            InvoiceStatus::Paid,
            InvoiceStatus::Overdue,
            InvoiceStatus::Void,
        ] {
            assert_eq!(InvoiceStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EstimateStatus::parse("cancelled"), None);
    }

    #[test]
    fn test_after_payment() {
        assert_eq!(InvoiceStatus::after_payment(10_000, 16_238), InvoiceStatus::Partial);
        assert_eq!(InvoiceStatus::after_payment(16_238, 16_238), InvoiceStatus::Paid);
        assert_eq!(InvoiceStatus::after_payment(20_000, 16_238), InvoiceStatus::Paid);
    }
}
