//! Position Loader Service
//!
//! EOD orchestration, intraday apply, manual upload and client sign-off.
//! Sole writer of position rows and reference tables.

pub mod service;
pub mod signoff;
pub mod validation;

pub use service::{EodOutcome, PositionLoader};
pub use signoff::SignoffPublisher;

use crate::errors::Result;
use crate::models::AccountSnapshot;
use async_trait::async_trait;
use chrono::NaiveDate;

/// Seam to the upstream portfolio-management feed. The mock upstream and the
/// real connector both live outside the core.
#[async_trait]
pub trait PositionFeed: Send + Sync {
    async fn fetch_snapshot(
        &self,
        account_id: i64,
        business_date: NaiveDate,
    ) -> Result<AccountSnapshot>;
}
