//! Reference Data Store
//!
//! Accounts and products, replicated from upstream snapshot headers. The
//! Position Loader is the only writer; other services consume via caches.

use super::Database;
use crate::errors::Result;
use crate::models::{AccountInfo, AssetClass, Product, SnapshotPosition};
use rusqlite::{params, OptionalExtension};

pub struct RefDataStore {
    db: Database,
}

impl RefDataStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn upsert_account(&self, account: &AccountInfo) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO accounts
             (account_id, account_number, account_type, fund_id, fund_name,
              client_id, client_name, base_currency)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(account_id) DO UPDATE SET
               account_number = excluded.account_number,
               account_type = excluded.account_type,
               fund_id = excluded.fund_id,
               fund_name = excluded.fund_name,
               client_id = excluded.client_id,
               client_name = excluded.client_name,
               base_currency = excluded.base_currency",
            params![
                account.account_id,
                account.account_number,
                account.account_type,
                account.fund_id,
                account.fund_name,
                account.client_id,
                account.client_name,
                account.base_currency,
            ],
        )?;
        Ok(())
    }

    pub fn get_account(&self, account_id: i64) -> Result<Option<AccountInfo>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT account_id, account_number, account_type, fund_id, fund_name,
                        client_id, client_name, base_currency
                 FROM accounts WHERE account_id = ?1",
                params![account_id],
                |row| {
                    Ok(AccountInfo {
                        account_id: row.get(0)?,
                        account_number: row.get(1)?,
                        account_type: row.get(2)?,
                        fund_id: row.get(3)?,
                        fund_name: row.get(4)?,
                        client_id: row.get(5)?,
                        client_name: row.get(6)?,
                        base_currency: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn accounts_for_client(&self, client_id: i64) -> Result<Vec<i64>> {
        let conn = self.db.lock();
        let mut stmt =
            conn.prepare("SELECT account_id FROM accounts WHERE client_id = ?1 ORDER BY account_id")?;
        let rows = stmt.query_map(params![client_id], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn accounts_for_fund(&self, fund_id: i64) -> Result<Vec<i64>> {
        let conn = self.db.lock();
        let mut stmt =
            conn.prepare("SELECT account_id FROM accounts WHERE fund_id = ?1 ORDER BY account_id")?;
        let rows = stmt.query_map(params![fund_id], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn all_account_ids(&self) -> Result<Vec<i64>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT account_id FROM accounts ORDER BY account_id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn upsert_product(&self, product: &Product) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO products
             (product_id, identifier_type, identifier, ticker, asset_class,
              issue_currency, settlement_currency, risk_region, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(product_id) DO UPDATE SET
               identifier_type = excluded.identifier_type,
               identifier = excluded.identifier,
               ticker = excluded.ticker,
               asset_class = excluded.asset_class,
               issue_currency = excluded.issue_currency,
               settlement_currency = excluded.settlement_currency,
               risk_region = excluded.risk_region,
               active = excluded.active",
            params![
                product.product_id,
                product.identifier_type,
                product.identifier,
                product.ticker,
                product.asset_class.as_str(),
                product.issue_currency,
                product.settlement_currency,
                product.risk_region,
                product.active as i64,
            ],
        )?;
        Ok(())
    }

    /// Register the minimal product carried on a snapshot row. Snapshot rows
    /// identify products by ticker; richer attributes arrive out-of-band.
    pub fn upsert_product_from_snapshot(&self, row: &SnapshotPosition) -> Result<()> {
        self.upsert_product(&Product {
            product_id: row.product_id,
            identifier_type: "TICKER".into(),
            identifier: row.ticker.clone(),
            ticker: row.ticker.clone(),
            asset_class: row.asset_class,
            issue_currency: row.issue_currency.clone(),
            settlement_currency: row.issue_currency.clone(),
            risk_region: None,
            active: true,
        })
    }

    pub fn get_product(&self, product_id: i64) -> Result<Option<Product>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT product_id, identifier_type, identifier, ticker, asset_class,
                        issue_currency, settlement_currency, risk_region, active
                 FROM products WHERE product_id = ?1",
                params![product_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, i64>(8)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(
            |(product_id, identifier_type, identifier, ticker, asset_class, issue, settle, region, active)| {
                Product {
                    product_id,
                    identifier_type,
                    identifier,
                    ticker,
                    asset_class: AssetClass::parse(&asset_class).unwrap_or(AssetClass::Equity),
                    issue_currency: issue,
                    settlement_currency: settle,
                    risk_region: region,
                    active: active != 0,
                }
            },
        ))
    }

    pub fn product_id_for_ticker(&self, ticker: &str) -> Result<Option<i64>> {
        let conn = self.db.lock();
        let id = conn
            .query_row(
                "SELECT product_id FROM products WHERE ticker = ?1 AND active = 1",
                params![ticker],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Active ticker -> product id pairs for a symbology refresh.
    pub fn ticker_map(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.db.lock();
        let mut stmt =
            conn.prepare("SELECT ticker, product_id FROM products WHERE active = 1")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
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

    fn store() -> RefDataStore {
        RefDataStore::new(Database::open_in_memory().unwrap())
    }

    fn account(account_id: i64, client_id: i64) -> AccountInfo {
        AccountInfo {
            account_id,
            account_number: format!("ACC-{account_id}"),
            account_type: "CUSTODY".into(),
            fund_id: 10,
            fund_name: "Global Macro".into(),
            client_id,
            client_name: "Meridian AM".into(),
            base_currency: "USD".into(),
        }
    }

    #[test]
    fn test_account_upsert_and_client_lookup() {
        let store = store();
        store.upsert_account(&account(1001, 55)).unwrap();
        store.upsert_account(&account(1002, 55)).unwrap();
        store.upsert_account(&account(2001, 77)).unwrap();

        assert_eq!(store.accounts_for_client(55).unwrap(), vec![1001, 1002]);
        let read = store.get_account(1001).unwrap().unwrap();
        assert_eq!(read.base_currency, "USD");

        // Upsert replaces
        let mut updated = account(1001, 55);
        updated.base_currency = "EUR".into();
        store.upsert_account(&updated).unwrap();
        assert_eq!(store.get_account(1001).unwrap().unwrap().base_currency, "EUR");
        assert_eq!(store.all_account_ids().unwrap(), vec![1001, 1002, 2001]);
    }

    #[test]
    fn test_product_ticker_map() {
        let store = store();
        store
            .upsert_product(&Product {
                product_id: 1,
                identifier_type: "ISIN".into(),
                identifier: "US0378331005".into(),
                ticker: "AAPL".into(),
                asset_class: AssetClass::Equity,
                issue_currency: "USD".into(),
                settlement_currency: "USD".into(),
                risk_region: Some("US".into()),
                active: true,
            })
            .unwrap();
        store
            .upsert_product(&Product {
                product_id: 2,
                identifier_type: "ISIN".into(),
                identifier: "XX0000000001".into(),
                ticker: "DEAD".into(),
                asset_class: AssetClass::Equity,
                issue_currency: "USD".into(),
                settlement_currency: "USD".into(),
                risk_region: None,
                active: false,
            })
            .unwrap();

        let map = store.ticker_map().unwrap();
        assert_eq!(map, vec![("AAPL".to_string(), 1)]);
        let product = store.get_product(1).unwrap().unwrap();
        assert_eq!(product.asset_class, AssetClass::Equity);
    }
}
