//! EOD Daily Status & Client Sign-off
//!
//! One row per (account, business_date). Transitions are monotonic:
//! PENDING -> IN_PROGRESS -> {COMPLETED | FAILED}, with FAILED re-enterable
//! via retry (FAILED -> IN_PROGRESS) and COMPLETED terminal.
//!
//! Sign-off is claimed exactly once per (client, business_date) through an
//! INSERT OR IGNORE row; only the claiming caller publishes.

use super::{date_to_sql, Database};
use crate::clock::Millis;
use crate::errors::{PlatformError, Result};
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EodStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl EodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EodStatus::Pending => "PENDING",
            EodStatus::InProgress => "IN_PROGRESS",
            EodStatus::Completed => "COMPLETED",
            EodStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(EodStatus::Pending),
            "IN_PROGRESS" => Some(EodStatus::InProgress),
            "COMPLETED" => Some(EodStatus::Completed),
            "FAILED" => Some(EodStatus::Failed),
            _ => None,
        }
    }

    /// Legal next states. FAILED is reachable from any non-terminal state.
    fn can_transition_to(&self, next: EodStatus) -> bool {
        match (self, next) {
            (EodStatus::Pending, EodStatus::InProgress) => true,
            (EodStatus::Pending, EodStatus::Failed) => true,
            (EodStatus::InProgress, EodStatus::Completed) => true,
            (EodStatus::InProgress, EodStatus::Failed) => true,
            // retry path
            (EodStatus::Failed, EodStatus::InProgress) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EodStatusRow {
    pub account_id: i64,
    pub business_date: NaiveDate,
    pub status: EodStatus,
    pub completed_at: Option<Millis>,
    pub position_count: Option<i64>,
    pub error_text: Option<String>,
}

pub struct EodStore {
    db: Database,
}

impl EodStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get_status(
        &self,
        account_id: i64,
        business_date: NaiveDate,
    ) -> Result<Option<EodStatusRow>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT status, completed_at, position_count, error_text
                 FROM eod_daily_status WHERE account_id = ?1 AND business_date = ?2",
                params![account_id, date_to_sql(business_date)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((status, completed_at, position_count, error_text)) => {
                let status = EodStatus::parse(&status)
                    .ok_or_else(|| PlatformError::Database(format!("bad EOD status {status}")))?;
                Ok(Some(EodStatusRow {
                    account_id,
                    business_date,
                    status,
                    completed_at,
                    position_count,
                    error_text,
                }))
            }
            None => Ok(None),
        }
    }

    /// Move the (account, date) state machine. Creates the row (as PENDING)
    /// when absent. Rejects non-monotonic transitions.
    pub fn transition(
        &self,
        account_id: i64,
        business_date: NaiveDate,
        next: EodStatus,
        position_count: Option<i64>,
        error_text: Option<&str>,
        now: Millis,
    ) -> Result<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM eod_daily_status
                 WHERE account_id = ?1 AND business_date = ?2",
                params![account_id, date_to_sql(business_date)],
                |row| row.get(0),
            )
            .optional()?;

        match current {
            None => {
                // Fresh row: implicit PENDING start, then the requested state
                let allowed = next == EodStatus::Pending
                    || EodStatus::Pending.can_transition_to(next);
                if !allowed {
                    return Err(PlatformError::EodTransition(format!(
                        "account {account_id} {business_date}: (none) -> {}",
                        next.as_str()
                    )));
                }
                tx.execute(
                    "INSERT INTO eod_daily_status
                     (account_id, business_date, status, completed_at, position_count, error_text)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        account_id,
                        date_to_sql(business_date),
                        next.as_str(),
                        completed_at(next, now),
                        position_count,
                        error_text,
                    ],
                )?;
            }
            Some(current) => {
                let current = EodStatus::parse(&current)
                    .ok_or_else(|| PlatformError::Database(format!("bad EOD status {current}")))?;
                // Re-asserting the current state refreshes its fields
                if current != next && !current.can_transition_to(next) {
                    return Err(PlatformError::EodTransition(format!(
                        "account {account_id} {business_date}: {} -> {}",
                        current.as_str(),
                        next.as_str()
                    )));
                }
                tx.execute(
                    "UPDATE eod_daily_status
                     SET status = ?3, completed_at = ?4, position_count = ?5, error_text = ?6
                     WHERE account_id = ?1 AND business_date = ?2",
                    params![
                        account_id,
                        date_to_sql(business_date),
                        next.as_str(),
                        completed_at(next, now),
                        position_count,
                        error_text,
                    ],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Accounts (of the known universe) not COMPLETED for the date. Drives
    /// the deadline-missed check.
    pub fn incomplete_accounts(&self, business_date: NaiveDate) -> Result<Vec<i64>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT a.account_id FROM accounts a
             LEFT JOIN eod_daily_status e
               ON e.account_id = a.account_id AND e.business_date = ?1
             WHERE e.status IS NULL OR e.status != 'COMPLETED'
             ORDER BY a.account_id",
        )?;
        let rows = stmt.query_map(params![date_to_sql(business_date)], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// (all accounts of the client completed?, account count).
    pub fn client_completion(
        &self,
        client_id: i64,
        business_date: NaiveDate,
    ) -> Result<(bool, usize)> {
        let conn = self.db.lock();
        let (total, done): (i64, i64) = conn.query_row(
            "SELECT count(*),
                    count(CASE WHEN e.status = 'COMPLETED' THEN 1 END)
             FROM accounts a
             LEFT JOIN eod_daily_status e
               ON e.account_id = a.account_id AND e.business_date = ?2
             WHERE a.client_id = ?1",
            params![client_id, date_to_sql(business_date)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((total > 0 && total == done, total as usize))
    }

    /// Exactly-once sign-off claim. True iff this caller inserted the row.
    pub fn try_claim_signoff(
        &self,
        client_id: i64,
        business_date: NaiveDate,
        account_count: usize,
        now: Millis,
    ) -> Result<bool> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO client_signoff
             (client_id, business_date, account_count, signed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                client_id,
                date_to_sql(business_date),
                account_count as i64,
                now
            ],
        )?;
        Ok(changed == 1)
    }
}

fn completed_at(status: EodStatus, now: Millis) -> Option<Millis> {
    match status {
        EodStatus::Completed => Some(now),
        _ => None,
    }
}
