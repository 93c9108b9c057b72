//! Persistence Layer
//!
//! Direct SQL over SQLite behind a shared connection handle. One `Database`
//! per process; each store type borrows it. Batch DML on the EOD insert and
//! intraday update hot paths.

pub mod audit;
pub mod eod;
pub mod fills;
pub mod positions;
pub mod prices;
pub mod refdata;
pub mod schema;

pub use audit::AuditStore;
pub use eod::{EodStatus, EodStatusRow, EodStore};
pub use fills::{FillStore, OrderSummary};
pub use positions::PositionStore;
pub use prices::PriceStore;
pub use refdata::RefDataStore;

use crate::errors::{PlatformError, Result};
use chrono::NaiveDate;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Shared connection handle. SQLite serializes writers anyway; a single
/// connection behind a fast mutex keeps transaction scopes explicit.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(schema::SCHEMA_SQL)?;
        info!(path, "database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Private in-memory database, used by tests and tooling.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(schema::SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

// --- column conversions ---

pub(crate) fn dec_to_sql(v: Decimal) -> String {
    v.to_string()
}

pub(crate) fn sql_to_dec(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).map_err(|e| PlatformError::Database(format!("bad decimal {s:?}: {e}")))
}

pub(crate) fn date_to_sql(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub(crate) fn sql_to_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| PlatformError::Database(format!("bad date {s:?}: {e}")))
}
