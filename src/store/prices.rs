//! Price & FX Rate Tables
//!
//! The durable backstop beneath the two-tier cache. The price service owns
//! writes and coalesces them: ticks mark rows dirty and a throttled flush
//! lands one batched transaction per interval. The "effective" price for
//! (product, date) is the highest-priority source with a non-zero value.

use super::{date_to_sql, dec_to_sql, sql_to_dec, Database};
use crate::cache::price_cache::{CacheEntry, PriceBackstop};
use crate::clock::SharedClock;
use crate::errors::Result;
use crate::models::PriceSource;
use chrono::NaiveDate;
use rusqlite::params;
use rust_decimal::Decimal;

/// One coalesced price write.
#[derive(Debug, Clone)]
pub struct PriceUpsert {
    pub product_id: i64,
    pub price_date: NaiveDate,
    pub source: PriceSource,
    pub value: Decimal,
}

/// One coalesced FX write.
#[derive(Debug, Clone)]
pub struct FxUpsert {
    pub pair: String,
    pub rate_date: NaiveDate,
    pub source: PriceSource,
    pub rate: Decimal,
    pub forward_points: Option<Decimal>,
}

const SOURCE_RANK_SQL: &str =
    "CASE source WHEN 'OVERRIDE' THEN 4 WHEN 'REALTIME' THEN 3 WHEN 'RCP_SNAP' THEN 2 ELSE 1 END";

pub struct PriceStore {
    db: Database,
    clock: SharedClock,
}

impl PriceStore {
    pub fn new(db: Database, clock: SharedClock) -> Self {
        Self { db, clock }
    }

    /// Batched flush of dirty prices and rates in one transaction.
    pub fn flush(&self, prices: &[PriceUpsert], rates: &[FxUpsert]) -> Result<usize> {
        if prices.is_empty() && rates.is_empty() {
            return Ok(0);
        }
        let now = self.clock.now_millis();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        {
            let mut price_stmt = tx.prepare(
                "INSERT INTO prices (product_id, price_date, source, price_value, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(product_id, price_date, source) DO UPDATE SET
                   price_value = excluded.price_value,
                   updated_at = excluded.updated_at",
            )?;
            for p in prices {
                price_stmt.execute(params![
                    p.product_id,
                    date_to_sql(p.price_date),
                    p.source.as_str(),
                    dec_to_sql(p.value),
                    now,
                ])?;
            }
            let mut fx_stmt = tx.prepare(
                "INSERT INTO fx_rates
                 (currency_pair, rate_date, source, spot_rate, forward_points, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(currency_pair, rate_date, source) DO UPDATE SET
                   spot_rate = excluded.spot_rate,
                   forward_points = excluded.forward_points,
                   updated_at = excluded.updated_at",
            )?;
            for r in rates {
                fx_stmt.execute(params![
                    r.pair,
                    date_to_sql(r.rate_date),
                    r.source.as_str(),
                    dec_to_sql(r.rate),
                    r.forward_points.map(dec_to_sql),
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(prices.len() + rates.len())
    }

    /// Highest-priority non-zero price for (product, date).
    pub fn effective_price(&self, product_id: i64, date: NaiveDate) -> Result<Option<CacheEntry>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT price_value, source, updated_at FROM prices
             WHERE product_id = ?1 AND price_date = ?2
             ORDER BY {SOURCE_RANK_SQL} DESC"
        ))?;
        let rows = stmt.query_map(params![product_id, date_to_sql(date)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        first_nonzero(rows)
    }

    /// Highest-priority non-zero spot rate for (pair, date).
    pub fn effective_fx(&self, pair: &str, date: NaiveDate) -> Result<Option<CacheEntry>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT spot_rate, source, updated_at FROM fx_rates
             WHERE currency_pair = ?1 AND rate_date = ?2
             ORDER BY {SOURCE_RANK_SQL} DESC"
        ))?;
        let rows = stmt.query_map(params![pair, date_to_sql(date)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        first_nonzero(rows)
    }
}

fn first_nonzero(
    rows: rusqlite::MappedRows<
        '_,
        impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<(String, String, i64)>,
    >,
) -> Result<Option<CacheEntry>> {
    for row in rows {
        let (value, source, updated_at) = row?;
        let value = sql_to_dec(&value)?;
        if value.is_zero() {
            continue;
        }
        return Ok(Some(CacheEntry {
            value,
            source: PriceSource::parse(&source).unwrap_or(PriceSource::Mspa),
            ts: updated_at,
        }));
    }
    Ok(None)
}

impl PriceBackstop for PriceStore {
    fn load_price(&self, product_id: i64) -> Result<Option<CacheEntry>> {
        self.effective_price(product_id, self.clock.today())
    }

    fn load_fx(&self, pair: &str) -> Result<Option<CacheEntry>> {
        self.effective_fx(pair, self.clock.today())
    }
}
