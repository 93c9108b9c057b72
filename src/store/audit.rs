//! Audit Log
//!
//! Append-only record of operator-visible actions: manual uploads, EOD
//! completions and failures, batch activations, sign-offs, orphan events.

use super::Database;
use crate::clock::Millis;
use crate::errors::Result;
use rusqlite::params;

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub actor: String,
    pub action: String,
    pub account_id: Option<i64>,
    pub detail: Option<String>,
    pub ts: Millis,
}

pub struct AuditStore {
    db: Database,
}

impl AuditStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn record(
        &self,
        actor: &str,
        action: &str,
        account_id: Option<i64>,
        detail: &str,
        now: Millis,
    ) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO audit_log (actor, action, account_id, detail, ts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![actor, action, account_id, detail, now],
        )?;
        Ok(())
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT actor, action, account_id, detail, ts FROM audit_log
             ORDER BY ts DESC, audit_id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(AuditRecord {
                actor: row.get(0)?,
                action: row.get(1)?,
                account_id: row.get(2)?,
                detail: row.get(3)?,
                ts: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_read_back() {
        let store = AuditStore::new(Database::open_in_memory().unwrap());
        store
            .record("ops.jsmith", "MANUAL_UPLOAD", Some(1001), "42 rows", 10)
            .unwrap();
        store.record("system", "EOD_COMPLETE", Some(1001), "", 20).unwrap();

        let recent = store.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].action, "EOD_COMPLETE");
        assert_eq!(recent[1].actor, "ops.jsmith");
        assert_eq!(recent[1].account_id, Some(1001));
    }
}
