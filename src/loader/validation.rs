//! Snapshot Validation
//!
//! Per-row validation of upstream snapshots. A bad row is recorded and
//! skipped; the enclosing snapshot only fails when the rejected share
//! crosses the configured threshold.

use crate::errors::PlatformError;
use crate::models::{AccountSnapshot, SnapshotPosition};

#[derive(Debug)]
pub struct ValidationOutcome {
    pub valid: Vec<SnapshotPosition>,
    pub rejected: Vec<(usize, PlatformError)>,
}

impl ValidationOutcome {
    pub fn rejected_ratio(&self, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            self.rejected.len() as f64 / total as f64
        }
    }
}

pub fn is_valid_currency(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase())
}

/// Validate the snapshot header. Header failures reject the whole snapshot.
pub fn validate_header(snapshot: &AccountSnapshot) -> Result<(), PlatformError> {
    if snapshot.account_id <= 0 {
        return Err(PlatformError::Validation {
            field: "account_id".into(),
            reason: format!("invalid id {}", snapshot.account_id),
        });
    }
    if !is_valid_currency(&snapshot.base_currency) {
        return Err(PlatformError::InvalidCurrency(snapshot.base_currency.clone()));
    }
    Ok(())
}

fn validate_row(row: &SnapshotPosition) -> Result<(), PlatformError> {
    if row.product_id <= 0 {
        return Err(PlatformError::Validation {
            field: "product_id".into(),
            reason: format!("invalid id {}", row.product_id),
        });
    }
    if row.ticker.trim().is_empty() {
        return Err(PlatformError::Validation {
            field: "ticker".into(),
            reason: "missing".into(),
        });
    }
    if !is_valid_currency(&row.issue_currency) {
        return Err(PlatformError::InvalidCurrency(row.issue_currency.clone()));
    }
    if row.quantity.is_zero() {
        return Err(PlatformError::Validation {
            field: "quantity".into(),
            reason: "zero quantity".into(),
        });
    }
    if row.price.is_zero() {
        return Err(PlatformError::ZeroPrice {
            product_id: row.product_id,
            source_name: "MSPM".into(),
        });
    }
    if row.price.is_sign_negative() {
        return Err(PlatformError::Validation {
            field: "price".into(),
            reason: format!("negative price {}", row.price),
        });
    }
    Ok(())
}

/// Validate every row; bad rows are collected, good rows pass through.
pub fn validate_rows(rows: &[SnapshotPosition]) -> ValidationOutcome {
    let mut valid = Vec::with_capacity(rows.len());
    let mut rejected = Vec::new();
    for (idx, row) in rows.iter().enumerate() {
        match validate_row(row) {
            Ok(()) => valid.push(row.clone()),
            Err(err) => {
                metrics::counter!("snapshot_rows_rejected_total", 1);
                rejected.push((idx, err));
            }
        }
    }
    ValidationOutcome { valid, rejected }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssetClass;
    use rust_decimal_macros::dec;

    fn row(product_id: i64, qty: &str, price: &str) -> SnapshotPosition {
        SnapshotPosition {
            product_id,
            ticker: "AAPL".into(),
            asset_class: AssetClass::Equity,
            issue_currency: "USD".into(),
            quantity: qty.parse().unwrap(),
            txn_type: "PHYSICAL".into(),
            price: price.parse().unwrap(),
            external_ref_id: None,
        }
    }

    #[test]
    fn test_good_rows_pass() {
        let outcome = validate_rows(&[row(1, "100", "150.25"), row(2, "-50", "2800")]);
        assert_eq!(outcome.valid.len(), 2);
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn test_zero_quantity_and_zero_price_rejected() {
        let outcome = validate_rows(&[
            row(1, "0", "150"),
            row(2, "10", "0"),
            row(3, "10", "150"),
        ]);
        assert_eq!(outcome.valid.len(), 1);
        assert_eq!(outcome.rejected.len(), 2);
        assert_eq!(outcome.rejected[0].1.code(), "VALIDATION_FAILED-201");
        assert_eq!(outcome.rejected[1].1.code(), "ZERO_PRICE_DETECTED-202");
    }

    #[test]
    fn test_invalid_currency_rejected() {
        let mut bad = row(1, "10", "150");
        bad.issue_currency = "EURO".into();
        let outcome = validate_rows(&[bad]);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].1.code(), "INVALID_CURRENCY-203");
    }

    #[test]
    fn test_rejected_ratio() {
        let outcome = validate_rows(&[row(1, "0", "1"), row(2, "1", "1")]);
        assert!((outcome.rejected_ratio(2) - 0.5).abs() < f64::EPSILON);
        assert_eq!(validate_rows(&[]).rejected_ratio(0), 0.0);
    }

    #[test]
    fn test_header_validation() {
        let snapshot = AccountSnapshot {
            account_id: 1001,
            client_id: 55,
            client_name: "Meridian AM".into(),
            fund_id: 10,
            fund_name: "Global Macro".into(),
            base_currency: "usd".into(),
            account_number: "ACC-1001".into(),
            account_type: "CUSTODY".into(),
            positions: vec![],
        };
        assert!(validate_header(&snapshot).is_err());
        let quantity_ok = dec!(1);
        assert!(!quantity_ok.is_zero());
    }
}
