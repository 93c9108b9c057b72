//! Fills Log & Order Summaries
//!
//! The fills table is append-only with `exec_id` as primary key, the
//! on-disk idempotency guarantee behind the KV-based fast path. Order
//! summaries are the durable mirror of the short-term lifecycle state and
//! survive KV loss. Forward contracts derived from executed forward fills
//! live here too.

use super::{date_to_sql, dec_to_sql, sql_to_date, sql_to_dec, Database};
use crate::clock::Millis;
use crate::errors::Result;
use crate::models::{ExecutionReport, ForwardContract, OrderStatus, Side};
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct OrderSummary {
    pub client_order_id: String,
    pub external_order_id: Option<String>,
    pub account_id: i64,
    pub ticker: String,
    pub side: Side,
    pub filled_qty: Decimal,
    pub notional: Decimal,
    pub fill_count: i64,
    pub status: OrderStatus,
    pub vwap: Option<Decimal>,
    pub updated_at: Millis,
}

pub struct FillStore {
    db: Database,
}

impl FillStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a fill. Returns false when the exec id already exists; the
    /// unique constraint is the durable dedup, independent of the KV store.
    pub fn insert_fill(&self, report: &ExecutionReport, now: Millis) -> Result<bool> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO fills
             (exec_id, client_order_id, account_id, ticker, side, last_qty, last_px,
              cum_qty, order_status, ts, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                report.exec_id,
                report.client_order_id,
                report.account_id,
                report.ticker,
                report.side.as_str(),
                dec_to_sql(report.last_qty),
                dec_to_sql(report.last_px),
                dec_to_sql(report.cum_qty),
                report.status.as_str(),
                report.ts,
                now,
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn fill_count(&self, client_order_id: &str) -> Result<u64> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM fills WHERE client_order_id = ?1",
            params![client_order_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Unconditional durable upsert of the order summary.
    pub fn upsert_order_summary(&self, summary: &OrderSummary) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO order_summary
             (client_order_id, external_order_id, account_id, ticker, side,
              filled_qty, notional, fill_count, status, vwap, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(client_order_id) DO UPDATE SET
               external_order_id = excluded.external_order_id,
               filled_qty = excluded.filled_qty,
               notional = excluded.notional,
               fill_count = excluded.fill_count,
               status = excluded.status,
               vwap = excluded.vwap,
               updated_at = excluded.updated_at",
            params![
                summary.client_order_id,
                summary.external_order_id,
                summary.account_id,
                summary.ticker,
                summary.side.as_str(),
                dec_to_sql(summary.filled_qty),
                dec_to_sql(summary.notional),
                summary.fill_count,
                summary.status.as_str(),
                summary.vwap.map(dec_to_sql),
                summary.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_order_summary(&self, client_order_id: &str) -> Result<Option<OrderSummary>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT client_order_id, external_order_id, account_id, ticker, side,
                        filled_qty, notional, fill_count, status, vwap, updated_at
                 FROM order_summary WHERE client_order_id = ?1",
                params![client_order_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, i64>(10)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((
                client_order_id,
                external_order_id,
                account_id,
                ticker,
                side,
                filled_qty,
                notional,
                fill_count,
                status,
                vwap,
                updated_at,
            )) => Ok(Some(OrderSummary {
                client_order_id,
                external_order_id,
                account_id,
                ticker,
                side: Side::parse(&side).unwrap_or(Side::Buy),
                filled_qty: sql_to_dec(&filled_qty)?,
                notional: sql_to_dec(&notional)?,
                fill_count,
                status: OrderStatus::parse(&status).unwrap_or(OrderStatus::New),
                vwap: match vwap {
                    Some(v) => Some(sql_to_dec(&v)?),
                    None => None,
                },
                updated_at,
            })),
        }
    }

    /// Mark an order orphaned in the durable summary. Returns false if the
    /// order was already terminal.
    pub fn mark_orphaned(&self, client_order_id: &str, now: Millis) -> Result<bool> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE order_summary SET status = 'ORPHANED', updated_at = ?2
             WHERE client_order_id = ?1
               AND status NOT IN ('FILLED', 'REJECTED', 'CANCELED', 'ORPHANED')",
            params![client_order_id, now],
        )?;
        Ok(changed == 1)
    }

    // --- forward contracts ---

    pub fn insert_forward(&self, contract: &ForwardContract) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT OR REPLACE INTO forward_contracts
             (client_order_id, account_id, currency_pair, notional, forward_rate,
              maturity_date, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                contract.client_order_id,
                contract.account_id,
                contract.currency_pair,
                dec_to_sql(contract.notional),
                dec_to_sql(contract.forward_rate),
                date_to_sql(contract.maturity_date),
                contract.created_at,
            ],
        )?;
        Ok(())
    }

    /// Contracts maturing on or before the horizon date, soonest first.
    pub fn forwards_maturing_by(&self, horizon: NaiveDate) -> Result<Vec<ForwardContract>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT client_order_id, account_id, currency_pair, notional, forward_rate,
                    maturity_date, created_at
             FROM forward_contracts WHERE maturity_date <= ?1
             ORDER BY maturity_date",
        )?;
        let rows = stmt.query_map(params![date_to_sql(horizon)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (client_order_id, account_id, currency_pair, notional, forward_rate, maturity, created_at) =
                row?;
            out.push(ForwardContract {
                client_order_id,
                account_id,
                currency_pair,
                notional: sql_to_dec(&notional)?,
                forward_rate: sql_to_dec(&forward_rate)?,
                maturity_date: sql_to_date(&maturity)?,
                created_at,
            });
        }
        Ok(out)
    }

    pub fn forwards_for_account(&self, account_id: i64) -> Result<Vec<ForwardContract>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT client_order_id, account_id, currency_pair, notional, forward_rate,
                    maturity_date, created_at
             FROM forward_contracts WHERE account_id = ?1
             ORDER BY maturity_date",
        )?;
        let rows = stmt.query_map(params![account_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (client_order_id, account_id, currency_pair, notional, forward_rate, maturity, created_at) =
                row?;
            out.push(ForwardContract {
                client_order_id,
                account_id,
                currency_pair,
                notional: sql_to_dec(&notional)?,
                forward_rate: sql_to_dec(&forward_rate)?,
                maturity_date: sql_to_date(&maturity)?,
                created_at,
            });
        }
        Ok(out)
    }
}
