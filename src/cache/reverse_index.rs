//! Reverse Index: product -> holding accounts
//!
//! Fans a single price tick out to the accounts that must be revalued.
//! Maintained incrementally on every position change and rebuilt wholesale
//! from the position store at startup. Eventually consistent: a tick racing
//! an index update may miss an account for at most one tick.

use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
pub struct ReverseIndex {
    by_product: RwLock<HashMap<i64, HashSet<i64>>>,
    by_account: RwLock<HashMap<i64, HashSet<i64>>>,
}

impl ReverseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Incremental maintenance: a zero quantity removes the holding.
    pub fn update_position(&self, account_id: i64, product_id: i64, quantity: Decimal) {
        if quantity.is_zero() {
            let mut by_product = self.by_product.write();
            if let Some(accounts) = by_product.get_mut(&product_id) {
                accounts.remove(&account_id);
                if accounts.is_empty() {
                    by_product.remove(&product_id);
                }
            }
            let mut by_account = self.by_account.write();
            if let Some(products) = by_account.get_mut(&account_id) {
                products.remove(&product_id);
                if products.is_empty() {
                    by_account.remove(&account_id);
                }
            }
        } else {
            self.by_product
                .write()
                .entry(product_id)
                .or_default()
                .insert(account_id);
            self.by_account
                .write()
                .entry(account_id)
                .or_default()
                .insert(product_id);
        }
    }

    /// Hot read path: one lookup per incoming tick.
    pub fn accounts_holding(&self, product_id: i64) -> Vec<i64> {
        self.by_product
            .read()
            .get(&product_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Replace one account's holdings with the given product set, diffing
    /// against what the index previously knew.
    pub fn sync_account(&self, account_id: i64, products: HashSet<i64>) {
        let previous = self
            .by_account
            .read()
            .get(&account_id)
            .cloned()
            .unwrap_or_default();

        let mut by_product = self.by_product.write();
        for gone in previous.difference(&products) {
            if let Some(accounts) = by_product.get_mut(gone) {
                accounts.remove(&account_id);
                if accounts.is_empty() {
                    by_product.remove(gone);
                }
            }
        }
        for added in products.difference(&previous) {
            by_product.entry(*added).or_default().insert(account_id);
        }
        drop(by_product);

        let mut by_account = self.by_account.write();
        if products.is_empty() {
            by_account.remove(&account_id);
        } else {
            by_account.insert(account_id, products);
        }
    }

    /// Wholesale rebuild from (account, product) pairs.
    pub fn rebuild<I: IntoIterator<Item = (i64, i64)>>(&self, holdings: I) {
        let mut by_product: HashMap<i64, HashSet<i64>> = HashMap::new();
        let mut by_account: HashMap<i64, HashSet<i64>> = HashMap::new();
        for (account_id, product_id) in holdings {
            by_product.entry(product_id).or_default().insert(account_id);
            by_account.entry(account_id).or_default().insert(product_id);
        }
        *self.by_product.write() = by_product;
        *self.by_account.write() = by_account;
    }

    pub fn product_count(&self) -> usize {
        self.by_product.read().len()
    }
}
