//! Hedge Analytics Views
//!
//! Read-model over the position store and the price/FX caches. Six views:
//! account valuation, currency exposure, fund rollup, unrealized P&L,
//! forward maturity ladder and hedge coverage. All are computed on demand;
//! stale price or FX inputs tag the result rather than blocking it.

use crate::cache::TieredCache;
use crate::clock::SharedClock;
use crate::errors::Result;
use crate::models::{split_pair, ForwardContract};
use crate::pricing::fx::FxConverter;
use crate::store::{FillStore, PositionStore, RefDataStore};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct ValuationRow {
    pub product_id: i64,
    pub ticker: Option<String>,
    pub issue_currency: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fx_rate: Decimal,
    pub market_value_local: Decimal,
    pub market_value_base: Decimal,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountValuation {
    pub account_id: i64,
    pub base_currency: String,
    pub rows: Vec<ValuationRow>,
    pub total_market_value_base: Decimal,
    pub stale_inputs: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrencyExposure {
    pub currency: String,
    pub net_market_value_local: Decimal,
    pub net_market_value_base: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct FundRollup {
    pub fund_id: i64,
    pub accounts: Vec<(i64, Decimal)>,
    pub total_market_value_base: Decimal,
    pub stale_inputs: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PnlRow {
    pub product_id: i64,
    pub market_value_local: Decimal,
    pub market_value_base: Decimal,
    pub cost_basis_local: Decimal,
    pub cost_basis_base: Decimal,
    pub unrealized_pnl_local: Decimal,
    pub unrealized_pnl_base: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaturityBucket {
    pub label: &'static str,
    pub contracts: Vec<ForwardContract>,
    pub total_notional: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct HedgeCoverage {
    pub currency: String,
    pub exposure_base: Decimal,
    pub hedged_notional: Decimal,
    pub coverage_ratio: Decimal,
}

pub struct HedgeAnalytics {
    clock: SharedClock,
    positions: Arc<PositionStore>,
    refdata: Arc<RefDataStore>,
    fills: Arc<FillStore>,
    cache: Arc<TieredCache>,
    fx: Arc<FxConverter>,
}

impl HedgeAnalytics {
    pub fn new(
        clock: SharedClock,
        positions: Arc<PositionStore>,
        refdata: Arc<RefDataStore>,
        fills: Arc<FillStore>,
        cache: Arc<TieredCache>,
        fx: Arc<FxConverter>,
    ) -> Self {
        Self {
            clock,
            positions,
            refdata,
            fills,
            cache,
            fx,
        }
    }

    /// View 1: per-account positions revalued at effective prices.
    pub async fn account_valuation(
        &self,
        account_id: i64,
        business_date: NaiveDate,
    ) -> Result<AccountValuation> {
        let base_currency = self
            .refdata
            .get_account(account_id)?
            .map(|a| a.base_currency)
            .unwrap_or_else(|| "USD".to_string());

        let mut rows = Vec::new();
        let mut total = Decimal::ZERO;
        let mut any_stale = false;

        for position in self.positions.get_positions_as_of(account_id, business_date)? {
            if position.excluded || position.quantity.is_zero() {
                continue;
            }
            let product = self.refdata.get_product(position.product_id)?;
            let issue_currency = product
                .as_ref()
                .map(|p| p.issue_currency.clone())
                .unwrap_or_else(|| base_currency.clone());

            // Freshest non-zero price available; fall back to the price the
            // batch was loaded with
            let (price, price_stale) = match self.cache.get_price(position.product_id).await {
                Some(lookup) => (lookup.entry.value, lookup.stale),
                None => (position.price_used, false),
            };
            let fx = self.fx.rate_or_identity(&issue_currency, &base_currency).await;

            let market_value_local = position.quantity * price;
            let market_value_base = market_value_local * fx.rate;
            let stale = price_stale || fx.stale;
            any_stale |= stale;
            total += market_value_base;

            rows.push(ValuationRow {
                product_id: position.product_id,
                ticker: product.map(|p| p.ticker),
                issue_currency,
                quantity: position.quantity,
                price,
                fx_rate: fx.rate,
                market_value_local,
                market_value_base,
                stale,
            });
        }

        Ok(AccountValuation {
            account_id,
            base_currency,
            rows,
            total_market_value_base: total,
            stale_inputs: any_stale,
        })
    }

    /// View 2: net exposure per currency for one account.
    pub async fn currency_exposure(
        &self,
        account_id: i64,
        business_date: NaiveDate,
    ) -> Result<Vec<CurrencyExposure>> {
        let valuation = self.account_valuation(account_id, business_date).await?;
        let mut by_currency: BTreeMap<String, (Decimal, Decimal)> = BTreeMap::new();
        for row in &valuation.rows {
            let entry = by_currency
                .entry(row.issue_currency.clone())
                .or_insert((Decimal::ZERO, Decimal::ZERO));
            entry.0 += row.market_value_local;
            entry.1 += row.market_value_base;
        }
        Ok(by_currency
            .into_iter()
            .map(|(currency, (local, base))| CurrencyExposure {
                currency,
                net_market_value_local: local,
                net_market_value_base: base,
            })
            .collect())
    }

    /// View 3: valuation aggregated to fund level.
    pub async fn fund_rollup(&self, fund_id: i64, business_date: NaiveDate) -> Result<FundRollup> {
        let mut accounts = Vec::new();
        let mut total = Decimal::ZERO;
        let mut any_stale = false;
        for account_id in self.refdata.accounts_for_fund(fund_id)? {
            let valuation = self.account_valuation(account_id, business_date).await?;
            any_stale |= valuation.stale_inputs;
            total += valuation.total_market_value_base;
            accounts.push((account_id, valuation.total_market_value_base));
        }
        Ok(FundRollup {
            fund_id,
            accounts,
            total_market_value_base: total,
            stale_inputs: any_stale,
        })
    }

    /// View 4: unrealized P&L per (account, product).
    pub async fn unrealized_pnl(
        &self,
        account_id: i64,
        business_date: NaiveDate,
    ) -> Result<Vec<PnlRow>> {
        let base_currency = self
            .refdata
            .get_account(account_id)?
            .map(|a| a.base_currency)
            .unwrap_or_else(|| "USD".to_string());
        let mut rows = Vec::new();
        for position in self.positions.get_positions_as_of(account_id, business_date)? {
            if position.excluded {
                continue;
            }
            let issue_currency = self
                .refdata
                .get_product(position.product_id)?
                .map(|p| p.issue_currency)
                .unwrap_or_else(|| base_currency.clone());
            let (price, _) = match self.cache.get_price(position.product_id).await {
                Some(lookup) => (lookup.entry.value, lookup.stale),
                None => (position.price_used, false),
            };
            let fx = self.fx.rate_or_identity(&issue_currency, &base_currency).await;
            let market_value_local = position.quantity * price;
            let market_value_base = market_value_local * fx.rate;
            rows.push(PnlRow {
                product_id: position.product_id,
                market_value_local,
                market_value_base,
                cost_basis_local: position.cost_basis_local,
                cost_basis_base: position.cost_basis_base,
                unrealized_pnl_local: market_value_local - position.cost_basis_local,
                unrealized_pnl_base: market_value_base - position.cost_basis_base,
            });
        }
        Ok(rows)
    }

    /// View 5: forward contracts bucketed by maturity.
    pub fn forward_ladder(&self, account_id: i64) -> Result<Vec<MaturityBucket>> {
        let today = self.clock.today();
        let mut buckets: Vec<MaturityBucket> = [
            ("within 7 days", 7i64),
            ("within 30 days", 30),
            ("within 90 days", 90),
            ("beyond 90 days", i64::MAX),
        ]
        .iter()
        .map(|(label, _)| MaturityBucket {
            label,
            contracts: Vec::new(),
            total_notional: Decimal::ZERO,
        })
        .collect();

        for contract in self.fills.forwards_for_account(account_id)? {
            let days_out = (contract.maturity_date - today).num_days();
            let idx = if days_out <= 7 {
                0
            } else if days_out <= 30 {
                1
            } else if days_out <= 90 {
                2
            } else {
                3
            };
            buckets[idx].total_notional += contract.notional;
            buckets[idx].contracts.push(contract);
        }
        Ok(buckets)
    }

    /// View 6: hedged forward notional against underlying currency
    /// exposure.
    pub async fn hedge_coverage(
        &self,
        account_id: i64,
        business_date: NaiveDate,
    ) -> Result<Vec<HedgeCoverage>> {
        let base_currency = self
            .refdata
            .get_account(account_id)?
            .map(|a| a.base_currency)
            .unwrap_or_else(|| "USD".to_string());

        let exposures = self.currency_exposure(account_id, business_date).await?;
        let forwards = self.fills.forwards_for_account(account_id)?;

        let mut out = Vec::new();
        for exposure in exposures {
            if exposure.currency == base_currency {
                continue;
            }
            let hedged: Decimal = forwards
                .iter()
                .filter(|f| {
                    split_pair(&f.currency_pair)
                        .map(|(base, _)| base == exposure.currency)
                        .unwrap_or(false)
                })
                .map(|f| f.notional)
                .sum();
            let exposure_abs = exposure.net_market_value_local.abs();
            let coverage_ratio = if exposure_abs.is_zero() {
                Decimal::ZERO
            } else {
                (hedged / exposure_abs).round_dp(4)
            };
            out.push(HedgeCoverage {
                currency: exposure.currency,
                exposure_base: exposure.net_market_value_base,
                hedged_notional: hedged,
                coverage_ratio,
            });
        }
        Ok(out)
    }
}
