//! Bitemporal Position Store
//!
//! Batch-oriented per-account positions. Both time dimensions use half-open
//! intervals: a row is visible for a query (B, S) iff
//! `valid_from <= B < valid_to` and `system_from <= S < system_to`.
//!
//! Staging protocol: rows inserted into a reserved (non-active) batch carry
//! `system_from = i64::MAX` so system-time queries cannot see them. The
//! atomic batch swap stamps them with the activation instant and closes the
//! superseded batch's open rows in the same transaction, so readers observe
//! either the full old batch or the full new batch, never a mixture.
//!
//! Intraday updates supersede: the prior row's `system_to` is closed at
//! `now` and a fresh row is inserted. Rows are never physically deleted
//! except via `clear_batch` on a non-active batch.

use super::{date_to_sql, dec_to_sql, Database};
use crate::clock::{SharedClock, SYSTEM_TIME_OPEN};
use crate::errors::{PlatformError, Result};
use crate::models::{Position, PositionType};
use chrono::NaiveDate;
use parking_lot::RwLock;
use rusqlite::{params, OptionalExtension};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use tracing::debug;

const POSITION_COLUMNS: &str = "account_id, product_id, batch_id, business_date, quantity, \
     price_used, fx_rate_used, market_value_local, market_value_base, \
     cost_basis_local, cost_basis_base, unrealized_pnl_local, unrealized_pnl_base, \
     source_system, position_type, excluded, valid_from, valid_to, system_from, system_to";

/// Column list qualified with a table alias for joined queries.
fn qualified_columns(alias: &str) -> String {
    POSITION_COLUMNS
        .split(", ")
        .map(|col| format!("{alias}.{col}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct PositionStore {
    db: Database,
    clock: SharedClock,
    active_cache: RwLock<HashMap<i64, i64>>,
}

impl PositionStore {
    pub fn new(db: Database, clock: SharedClock) -> Self {
        Self {
            db,
            clock,
            active_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Cached read of the active batch id.
    pub fn get_active_batch_id(&self, account_id: i64) -> Result<Option<i64>> {
        if let Some(batch) = self.active_cache.read().get(&account_id) {
            return Ok(Some(*batch));
        }
        let conn = self.db.lock();
        let active: Option<Option<i64>> = conn
            .query_row(
                "SELECT active_batch_id FROM batch_control WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()?;
        let active = active.flatten();
        if let Some(batch) = active {
            self.active_cache.write().insert(account_id, batch);
        }
        Ok(active)
    }

    /// Reserve the next batch slot for an account. Atomic; the new batch is
    /// not active until `activate_batch`.
    pub fn create_batch(&self, account_id: i64) -> Result<i64> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO batch_control (account_id, active_batch_id, last_batch_id)
             VALUES (?1, NULL, 1)
             ON CONFLICT(account_id) DO UPDATE SET last_batch_id = last_batch_id + 1",
            params![account_id],
        )?;
        let batch_id: i64 = tx.query_row(
            "SELECT last_batch_id FROM batch_control WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        debug!(account_id, batch_id, "batch reserved");
        Ok(batch_id)
    }

    /// Batched insert into a reserved batch. Idempotent per
    /// (account, product, batch): duplicate rows are rejected by the unique
    /// constraint and ignored. Returns (inserted, rejected).
    pub fn insert_positions(
        &self,
        account_id: i64,
        batch_id: i64,
        rows: &[Position],
    ) -> Result<(usize, usize)> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let (active, last): (Option<i64>, i64) = tx
            .query_row(
                "SELECT active_batch_id, last_batch_id FROM batch_control WHERE account_id = ?1",
                params![account_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| {
                PlatformError::BatchConflict(format!("no batch reserved for account {account_id}"))
            })?;
        if batch_id > last {
            return Err(PlatformError::BatchConflict(format!(
                "batch {batch_id} not reserved for account {account_id}"
            )));
        }
        if active == Some(batch_id) {
            return Err(PlatformError::BatchConflict(format!(
                "batch {batch_id} is already active for account {account_id}"
            )));
        }

        let mut inserted = 0usize;
        let mut rejected = 0usize;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR IGNORE INTO positions ({POSITION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
            ))?;
            for row in rows {
                let changed = stmt.execute(params![
                    account_id,
                    row.product_id,
                    batch_id,
                    date_to_sql(row.business_date),
                    dec_to_sql(row.quantity),
                    dec_to_sql(row.price_used),
                    dec_to_sql(row.fx_rate_used),
                    dec_to_sql(row.market_value_local),
                    dec_to_sql(row.market_value_base),
                    dec_to_sql(row.cost_basis_local),
                    dec_to_sql(row.cost_basis_base),
                    dec_to_sql(row.unrealized_pnl_local),
                    dec_to_sql(row.unrealized_pnl_base),
                    row.source_system,
                    row.position_type.as_str(),
                    row.excluded as i64,
                    date_to_sql(row.valid_from),
                    date_to_sql(row.valid_to),
                    SYSTEM_TIME_OPEN, // staged: invisible until activation
                    SYSTEM_TIME_OPEN,
                ])?;
                if changed == 1 {
                    inserted += 1;
                } else {
                    rejected += 1;
                }
            }
        }
        tx.commit()?;
        Ok((inserted, rejected))
    }

    /// Per-position upsert into the active batch with bitemporal
    /// supersession: the previous open row is closed at `now` and a fresh
    /// row is written with `system_from = now`.
    pub fn update_positions(&self, account_id: i64, rows: &[Position]) -> Result<usize> {
        let now = self.clock.now_millis();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let active: Option<i64> = tx
            .query_row(
                "SELECT active_batch_id FROM batch_control WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let batch_id = active.ok_or_else(|| {
            PlatformError::BatchConflict(format!("no active batch for account {account_id}"))
        })?;

        {
            let mut close = tx.prepare(
                "UPDATE positions SET system_to = ?1
                 WHERE account_id = ?2 AND product_id = ?3 AND batch_id = ?4 AND system_to = ?5",
            )?;
            let mut insert = tx.prepare(&format!(
                "INSERT INTO positions ({POSITION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
            ))?;
            for row in rows {
                close.execute(params![
                    now,
                    account_id,
                    row.product_id,
                    batch_id,
                    SYSTEM_TIME_OPEN
                ])?;
                insert.execute(params![
                    account_id,
                    row.product_id,
                    batch_id,
                    date_to_sql(row.business_date),
                    dec_to_sql(row.quantity),
                    dec_to_sql(row.price_used),
                    dec_to_sql(row.fx_rate_used),
                    dec_to_sql(row.market_value_local),
                    dec_to_sql(row.market_value_base),
                    dec_to_sql(row.cost_basis_local),
                    dec_to_sql(row.cost_basis_base),
                    dec_to_sql(row.unrealized_pnl_local),
                    dec_to_sql(row.unrealized_pnl_base),
                    row.source_system,
                    row.position_type.as_str(),
                    row.excluded as i64,
                    date_to_sql(row.valid_from),
                    date_to_sql(row.valid_to),
                    now,
                    SYSTEM_TIME_OPEN,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Atomic swap: stamp the staged batch's rows with the activation
    /// instant, close the superseded batch's open rows, flip the active
    /// marker. One transaction; readers see old or new, never a mixture.
    pub fn activate_batch(&self, account_id: i64, batch_id: i64) -> Result<()> {
        let now = self.clock.now_millis();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let (active, last): (Option<i64>, i64) = tx
            .query_row(
                "SELECT active_batch_id, last_batch_id FROM batch_control WHERE account_id = ?1",
                params![account_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| {
                PlatformError::BatchConflict(format!("no batch reserved for account {account_id}"))
            })?;
        if batch_id > last {
            return Err(PlatformError::BatchConflict(format!(
                "batch {batch_id} not reserved for account {account_id}"
            )));
        }
        if active == Some(batch_id) {
            return Ok(()); // idempotent re-activation
        }

        tx.execute(
            "UPDATE positions SET system_from = ?1
             WHERE account_id = ?2 AND batch_id = ?3 AND system_from = ?4",
            params![now, account_id, batch_id, SYSTEM_TIME_OPEN],
        )?;
        if let Some(old) = active {
            tx.execute(
                "UPDATE positions SET system_to = ?1
                 WHERE account_id = ?2 AND batch_id = ?3 AND system_to = ?4",
                params![now, account_id, old, SYSTEM_TIME_OPEN],
            )?;
        }
        tx.execute(
            "UPDATE batch_control SET active_batch_id = ?1 WHERE account_id = ?2",
            params![batch_id, account_id],
        )?;
        tx.commit()?;
        self.active_cache.write().insert(account_id, batch_id);
        debug!(account_id, batch_id, "batch activated");
        Ok(())
    }

    /// Delete all positions in a non-active batch.
    pub fn clear_batch(&self, account_id: i64, batch_id: i64) -> Result<usize> {
        let conn = self.db.lock();
        let active: Option<i64> = conn
            .query_row(
                "SELECT active_batch_id FROM batch_control WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        if active == Some(batch_id) {
            return Err(PlatformError::BatchConflict(format!(
                "cannot clear active batch {batch_id} for account {account_id}"
            )));
        }
        let deleted = conn.execute(
            "DELETE FROM positions WHERE account_id = ?1 AND batch_id = ?2",
            params![account_id, batch_id],
        )?;
        Ok(deleted)
    }

    /// Point-in-business-time read against the active batch at current
    /// system knowledge. The active batch is resolved inside the same
    /// statement so a read can never straddle a batch swap.
    pub fn get_positions_as_of(
        &self,
        account_id: i64,
        business_date: NaiveDate,
    ) -> Result<Vec<Position>> {
        let now = self.clock.now_millis();
        let conn = self.db.lock();
        let cols = qualified_columns("p");
        let mut stmt = conn.prepare(&format!(
            "SELECT {cols} FROM positions p
             JOIN batch_control bc
               ON bc.account_id = p.account_id AND bc.active_batch_id = p.batch_id
             WHERE p.account_id = ?1
               AND p.valid_from <= ?2 AND ?2 < p.valid_to
               AND p.system_from <= ?3 AND ?3 < p.system_to
             ORDER BY p.product_id"
        ))?;
        let rows = stmt.query_map(
            params![account_id, date_to_sql(business_date), now],
            map_position,
        )?;
        collect_positions(rows)
    }

    /// Point-in-system-time quantity: "what did we know at S?".
    pub fn get_quantity_as_of(
        &self,
        account_id: i64,
        product_id: i64,
        system_instant: i64,
    ) -> Result<Option<Decimal>> {
        let conn = self.db.lock();
        let qty: Option<String> = conn
            .query_row(
                "SELECT quantity FROM positions
                 WHERE account_id = ?1 AND product_id = ?2
                   AND system_from <= ?3 AND ?3 < system_to
                 ORDER BY system_from DESC LIMIT 1",
                params![account_id, product_id, system_instant],
                |row| row.get(0),
            )
            .optional()?;
        match qty {
            Some(s) => Ok(Some(super::sql_to_dec(&s)?)),
            None => Ok(None),
        }
    }

    /// All open rows of a batch, staged rows included. Used for snapshot
    /// comparison and validation tooling.
    pub fn get_batch_positions(&self, account_id: i64, batch_id: i64) -> Result<Vec<Position>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions
             WHERE account_id = ?1 AND batch_id = ?2 AND system_to = ?3
             ORDER BY product_id"
        ))?;
        let rows = stmt.query_map(params![account_id, batch_id, SYSTEM_TIME_OPEN], map_position)?;
        collect_positions(rows)
    }

    /// (account, product) pairs with a non-zero current position in the
    /// account's active batch. Feeds the reverse-index rebuild.
    pub fn current_holdings(&self) -> Result<Vec<(i64, i64)>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT p.account_id, p.product_id, p.quantity FROM positions p
             JOIN batch_control bc
               ON bc.account_id = p.account_id AND bc.active_batch_id = p.batch_id
             WHERE p.system_to = ?1 AND p.system_from != ?1",
        )?;
        let rows = stmt.query_map(params![SYSTEM_TIME_OPEN], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (account_id, product_id, qty) = row?;
            if !super::sql_to_dec(&qty)?.is_zero() {
                out.push((account_id, product_id));
            }
        }
        Ok(out)
    }

    /// Products with a non-zero current position for one account.
    pub fn current_position_keys(&self, account_id: i64) -> Result<HashSet<i64>> {
        let batch_id = match self.get_active_batch_id(account_id)? {
            Some(b) => b,
            None => return Ok(HashSet::new()),
        };
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT product_id, quantity FROM positions
             WHERE account_id = ?1 AND batch_id = ?2 AND system_to = ?3",
        )?;
        let rows = stmt.query_map(params![account_id, batch_id, SYSTEM_TIME_OPEN], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = HashSet::new();
        for row in rows {
            let (product_id, qty) = row?;
            if !super::sql_to_dec(&qty)?.is_zero() {
                out.insert(product_id);
            }
        }
        Ok(out)
    }
}

fn map_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<Position> {
    fn dec(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
        let s: String = row.get(idx)?;
        Decimal::from_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    }
    fn date(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
        let s: String = row.get(idx)?;
        NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    }
    let position_type: String = row.get(14)?;
    Ok(Position {
        account_id: row.get(0)?,
        product_id: row.get(1)?,
        batch_id: row.get(2)?,
        business_date: date(row, 3)?,
        quantity: dec(row, 4)?,
        price_used: dec(row, 5)?,
        fx_rate_used: dec(row, 6)?,
        market_value_local: dec(row, 7)?,
        market_value_base: dec(row, 8)?,
        cost_basis_local: dec(row, 9)?,
        cost_basis_base: dec(row, 10)?,
        unrealized_pnl_local: dec(row, 11)?,
        unrealized_pnl_base: dec(row, 12)?,
        source_system: row.get(13)?,
        position_type: PositionType::parse(&position_type).unwrap_or(PositionType::Physical),
        excluded: row.get::<_, i64>(15)? != 0,
        valid_from: date(row, 16)?,
        valid_to: date(row, 17)?,
        system_from: row.get(18)?,
        system_to: row.get(19)?,
    })
}

fn collect_positions(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<Position>>,
) -> Result<Vec<Position>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
