//! Hedge Analytics
//!
//! On-demand read views over positions, prices and forward contracts.

pub mod views;

pub use views::{
    AccountValuation, CurrencyExposure, FundRollup, HedgeAnalytics, HedgeCoverage,
    MaturityBucket, PnlRow, ValuationRow,
};
