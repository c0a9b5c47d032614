//! Server-side money arithmetic. All amounts are integer minor units; tax
//! rates are basis points (825 = 8.25%). Client-supplied totals are never
//! read, every figure here is recomputed from quantity and unit price.

use serde::{Deserialize, Serialize};

use crate::core::error::{CoreError, CoreResult};

pub const BPS_DENOMINATOR: i64 = 10_000;
pub const MAX_TAX_RATE_BPS: i32 = 10_000;
pub const DEFAULT_DEPOSIT_PERCENT: u32 = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItemInput {
    pub description: String,
    pub quantity: f64,
    pub unit_price: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PricedLine {
    pub description: String,
    pub quantity: f64,
    pub unit_price: i64,
    pub line_total: i64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct DocumentTotals {
    pub subtotal: i64,
    pub tax_amount: i64,
    pub total: i64,
}

/// `round(quantity × unit_price)`, half-up on the minor-unit value.
pub fn compute_line_total(quantity: f64, unit_price: i64) -> CoreResult<i64> {
    if !quantity.is_finite() || quantity <= 0.0 {
        return Err(CoreError::Validation(format!(
            "quantity must be a positive number, got {quantity}"
        )));
    }
    if unit_price < 0 {
        return Err(CoreError::Validation(format!(
            "unit price must not be negative, got {unit_price}"
        )));
    }

    let raw = (quantity * unit_price as f64).round();
    if raw > i64::MAX as f64 {
        return Err(CoreError::Validation("line total out of range".to_string()));
    }
    Ok(raw as i64)
}

/// `round(subtotal × bps / 10000)`, half-up.
pub fn compute_tax(subtotal: i64, tax_rate_bps: i32) -> CoreResult<i64> {
    validate_tax_rate(tax_rate_bps)?;
    let scaled = i128::from(subtotal) * i128::from(tax_rate_bps) + i128::from(BPS_DENOMINATOR / 2);
    i64::try_from(scaled / i128::from(BPS_DENOMINATOR))
        .map_err(|_| CoreError::Validation("tax amount out of range".to_string()))
}

pub fn validate_tax_rate(tax_rate_bps: i32) -> CoreResult<()> {
    if !(0..=MAX_TAX_RATE_BPS).contains(&tax_rate_bps) {
        return Err(CoreError::Validation(format!(
            "tax rate must be between 0 and {MAX_TAX_RATE_BPS} basis points, got {tax_rate_bps}"
        )));
    }
    Ok(())
}

pub fn price_lines(items: &[LineItemInput]) -> CoreResult<Vec<PricedLine>> {
    if items.is_empty() {
        return Err(CoreError::Validation(
            "at least one line item is required".to_string(),
        ));
    }

    items
        .iter()
        .map(|item| {
            let description = item.description.trim();
            if description.is_empty() {
                return Err(CoreError::Validation(
                    "line item description is required".to_string(),
                ));
            }
            Ok(PricedLine {
                description: description.to_string(),
                quantity: item.quantity,
                unit_price: item.unit_price,
                line_total: compute_line_total(item.quantity, item.unit_price)?,
            })
        })
        .collect()
}

pub fn compute_totals(lines: &[PricedLine], tax_rate_bps: i32) -> CoreResult<DocumentTotals> {
    let subtotal = lines
        .iter()
        .try_fold(0_i64, |acc, line| acc.checked_add(line.line_total))
        .ok_or_else(|| CoreError::Validation("subtotal out of range".to_string()))?;
    let tax_amount = compute_tax(subtotal, tax_rate_bps)?;
    let total = subtotal
        .checked_add(tax_amount)
        .ok_or_else(|| CoreError::Validation("total out of range".to_string()))?;

    Ok(DocumentTotals {
        subtotal,
        tax_amount,
        total,
    })
}

/// Deposit due on an estimate: the explicit amount when given, otherwise
/// `round(total × percent / 100)`.
pub fn deposit_amount(total: i64, amount: Option<i64>, percent: Option<u32>, default_percent: u32) -> CoreResult<i64> {
    let deposit = match amount {
        Some(explicit) => explicit,
        None => {
            let percent = percent.unwrap_or(default_percent);
            if percent == 0 || percent > 100 {
                return Err(CoreError::Validation(format!(
                    "deposit percentage must be between 1 and 100, got {percent}"
                )));
            }
            let scaled = i128::from(total) * i128::from(percent) + 50;
            i64::try_from(scaled / 100)
                .map_err(|_| CoreError::Validation("deposit out of range".to_string()))?
        }
    };

    if deposit <= 0 {
        return Err(CoreError::Validation(
            "deposit amount must be positive".to_string(),
        ));
    }
    if deposit > total {
        return Err(CoreError::Validation(format!(
            "deposit amount {deposit} exceeds estimate total {total}"
        )));
    }
    Ok(deposit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(quantity: f64, unit_price: i64) -> LineItemInput {
        LineItemInput {
            description: "Service".to_string(),
            quantity,
            unit_price,
        }
    }

    #[test]
    fn test_single_line_with_825_bps_tax() {
        let lines = price_lines(&[line(1.0, 8500)]).unwrap();
        let totals = compute_totals(&lines, 825).unwrap();
        assert_eq!(totals.subtotal, 8500);
        assert_eq!(totals.tax_amount, 701);
        assert_eq!(totals.total, 9201);
    }

    #[test]
    fn test_tax_rounds_half_up() {
        // 15000 × 8.25% = 1237.5
        assert_eq!(compute_tax(15_000, 825).unwrap(), 1238);
        assert_eq!(compute_tax(0, 825).unwrap(), 0);
        assert_eq!(compute_tax(100, 0).unwrap(), 0);
    }

    #[test]
    fn test_fractional_quantity_rounds() {
        assert_eq!(compute_line_total(1.5, 333).unwrap(), 500);
        assert_eq!(compute_line_total(2.0, 4250).unwrap(), 8500);
        assert_eq!(compute_line_total(0.25, 10).unwrap(), 3);
    }

    #[test]
    fn test_total_is_subtotal_plus_tax() {
        let lines = price_lines(&[line(3.0, 1999), line(1.25, 7450), line(1.0, 12)]).unwrap();
        let totals = compute_totals(&lines, 725).unwrap();
        assert_eq!(totals.subtotal + totals.tax_amount, totals.total);
        assert_eq!(totals.tax_amount, compute_tax(totals.subtotal, 725).unwrap());
    }

    #[test]
    fn test_rejects_bad_lines() {
        assert!(price_lines(&[]).is_err());
        assert!(price_lines(&[line(0.0, 100)]).is_err());
        assert!(price_lines(&[line(-1.0, 100)]).is_err());
        assert!(price_lines(&[line(f64::NAN, 100)]).is_err());
        assert!(price_lines(&[line(1.0, -5)]).is_err());
        let blank = LineItemInput {
            description: "   ".to_string(),
            quantity: 1.0,
            unit_price: 100,
        };
        assert!(price_lines(&[blank]).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_tax() {
        assert!(validate_tax_rate(-1).is_err());
        assert!(validate_tax_rate(10_001).is_err());
        assert!(validate_tax_rate(10_000).is_ok());
    }

    #[test]
    fn test_default_half_deposit() {
        assert_eq!(deposit_amount(16_238, None, None, DEFAULT_DEPOSIT_PERCENT).unwrap(), 8119);
        assert_eq!(deposit_amount(16_239, None, None, DEFAULT_DEPOSIT_PERCENT).unwrap(), 8120);
        assert_eq!(deposit_amount(16_238, None, Some(25), DEFAULT_DEPOSIT_PERCENT).unwrap(), 4060);
    }

    #[test]
    fn test_explicit_deposit_bounds() {
        assert_eq!(deposit_amount(16_238, Some(5_000), None, 50).unwrap(), 5_000);
        assert_eq!(deposit_amount(16_238, Some(16_238), None, 50).unwrap(), 16_238);
        assert!(deposit_amount(16_238, Some(16_239), None, 50).is_err());
        assert!(deposit_amount(16_238, Some(0), None, 50).is_err());
        assert!(deposit_amount(16_238, None, Some(0), 50).is_err());
        assert!(deposit_amount(16_238, None, Some(101), 50).is_err());
    }
}
