//! Price Service
//!
//! Consumes market-data and FX ticks, resolves symbology, writes the
//! two-tier cache under the source-rank rule, marks the underlying rows
//! dirty for a throttled coalesced flush, and fans each accepted tick out
//! through the reverse index into per-account revaluations, conflated
//! before emission.
//!
//! Also keeps the reverse index and symbology fresh from position-change
//! events, which may arrive on the fabric, on the direct notification
//! channel, or both; duplicates are dropped on (account, type, ts).

use crate::cache::price_cache::CacheEntry;
use crate::cache::{ReverseIndex, SymbologyResolver, TieredCache};
use crate::clock::SharedClock;
use crate::config::Config;
use crate::errors::{PlatformError, Result};
use crate::fabric::{topics, Broker, Envelope};
use crate::models::{
    round_price, FxRateTick, PositionChangeEvent, PositionEventType, PriceTick, split_pair,
};
use crate::pricing::fx::FxConverter;
use crate::pricing::revaluation::{ConflationBuffer, RevaluationUpdate, SubscriptionHub};
use crate::resilience::{DependencyGuards, RetryPolicy};
use crate::shutdown::ShutdownSignal;
use crate::store::prices::{FxUpsert, PriceUpsert};
use crate::store::{PositionStore, PriceStore, RefDataStore};
use chrono::NaiveDate;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct PricingStats {
    pub ticks_processed: AtomicU64,
    pub fx_ticks_processed: AtomicU64,
    pub unresolved_tickers: AtomicU64,
    pub revaluations_enqueued: AtomicU64,
    pub revaluations_emitted: AtomicU64,
    pub events_deduped: AtomicU64,
    pub index_syncs: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PricingStatsSnapshot {
    pub ticks_processed: u64,
    pub fx_ticks_processed: u64,
    pub unresolved_tickers: u64,
    pub revaluations_enqueued: u64,
    pub revaluations_emitted: u64,
    pub events_deduped: u64,
    pub index_syncs: u64,
}

impl PricingStats {
    pub fn snapshot(&self) -> PricingStatsSnapshot {
        PricingStatsSnapshot {
            ticks_processed: self.ticks_processed.load(Ordering::Relaxed),
            fx_ticks_processed: self.fx_ticks_processed.load(Ordering::Relaxed),
            unresolved_tickers: self.unresolved_tickers.load(Ordering::Relaxed),
            revaluations_enqueued: self.revaluations_enqueued.load(Ordering::Relaxed),
            revaluations_emitted: self.revaluations_emitted.load(Ordering::Relaxed),
            events_deduped: self.events_deduped.load(Ordering::Relaxed),
            index_syncs: self.index_syncs.load(Ordering::Relaxed),
        }
    }
}

pub struct PriceService {
    cfg: Arc<Config>,
    clock: SharedClock,
    broker: Arc<Broker>,
    cache: Arc<TieredCache>,
    fx: Arc<FxConverter>,
    symbology: Arc<SymbologyResolver>,
    reverse_index: Arc<ReverseIndex>,
    positions: Arc<PositionStore>,
    refdata: Arc<RefDataStore>,
    price_store: Arc<PriceStore>,
    guards: Arc<DependencyGuards>,
    hub: Arc<SubscriptionHub>,
    conflation: ConflationBuffer,
    dirty_prices: Mutex<HashMap<(i64, NaiveDate), PriceUpsert>>,
    dirty_fx: Mutex<HashMap<(String, NaiveDate), FxUpsert>>,
    seen_events: Mutex<HashSet<(i64, PositionEventType, i64)>>,
    stats: PricingStats,
}

impl PriceService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<Config>,
        clock: SharedClock,
        broker: Arc<Broker>,
        cache: Arc<TieredCache>,
        fx: Arc<FxConverter>,
        symbology: Arc<SymbologyResolver>,
        reverse_index: Arc<ReverseIndex>,
        positions: Arc<PositionStore>,
        refdata: Arc<RefDataStore>,
        price_store: Arc<PriceStore>,
        guards: Arc<DependencyGuards>,
        hub: Arc<SubscriptionHub>,
    ) -> Self {
        Self {
            cfg,
            clock,
            broker,
            cache,
            fx,
            symbology,
            reverse_index,
            positions,
            refdata,
            price_store,
            guards,
            hub,
            conflation: ConflationBuffer::new(),
            dirty_prices: Mutex::new(HashMap::new()),
            dirty_fx: Mutex::new(HashMap::new()),
            seen_events: Mutex::new(HashSet::new()),
            stats: PricingStats::default(),
        }
    }

    pub fn stats(&self) -> &PricingStats {
        &self.stats
    }

    pub fn hub(&self) -> &Arc<SubscriptionHub> {
        &self.hub
    }

    /// Rebuild the reverse index and symbology from the stores. Called at
    /// startup.
    pub fn rebuild(&self) -> Result<()> {
        self.reverse_index.rebuild(self.positions.current_holdings()?);
        self.symbology.reload(self.refdata.ticker_map()?);
        info!(
            products = self.reverse_index.product_count(),
            tickers = self.symbology.len(),
            "reverse index and symbology rebuilt"
        );
        Ok(())
    }

    // =========================================================================
    // TICK INGESTION
    // =========================================================================

    pub async fn handle_price_tick(&self, tick: &PriceTick) -> Result<()> {
        self.stats.ticks_processed.fetch_add(1, Ordering::Relaxed);

        let product_id = match tick
            .product_id
            .or_else(|| self.symbology.resolve_ticker(&tick.ticker))
        {
            Some(id) => id,
            None => {
                self.stats.unresolved_tickers.fetch_add(1, Ordering::Relaxed);
                debug!(ticker = %tick.ticker, "unresolved ticker, tick skipped");
                return Ok(());
            }
        };

        if tick.price.is_zero() {
            // canonical past-failure mode: never cache, never revalue to zero
            metrics::counter!("zero_price_detected_total", 1);
            warn!(product_id, source = tick.source.as_str(), "zero price tick ignored");
            return Ok(());
        }

        let entry = CacheEntry {
            value: round_price(tick.price),
            source: tick.source,
            ts: tick.ts,
        };
        let outcome = self.cache.put_price(product_id, entry).await;
        if outcome != crate::cache::PutOutcome::Accepted {
            debug!(product_id, ?outcome, "price write rejected by cache");
            return Ok(());
        }

        self.dirty_prices.lock().insert(
            (product_id, self.clock.today()),
            PriceUpsert {
                product_id,
                price_date: self.clock.today(),
                source: tick.source,
                value: entry.value,
            },
        );

        for account_id in self.reverse_index.accounts_holding(product_id) {
            self.revalue(account_id, product_id, entry.value, false).await;
        }
        Ok(())
    }

    pub async fn handle_fx_tick(&self, tick: &FxRateTick) -> Result<()> {
        self.stats.fx_ticks_processed.fetch_add(1, Ordering::Relaxed);

        if split_pair(&tick.pair).is_none() {
            return Err(PlatformError::InvalidCurrency(tick.pair.clone()));
        }
        if tick.rate.is_zero() {
            metrics::counter!("zero_price_detected_total", 1);
            warn!(pair = %tick.pair, "zero FX rate ignored");
            return Ok(());
        }

        let entry = CacheEntry {
            value: tick.rate,
            source: tick.source,
            ts: tick.ts,
        };
        if self.cache.put_fx(&tick.pair, entry).await != crate::cache::PutOutcome::Accepted {
            return Ok(());
        }
        self.dirty_fx.lock().insert(
            (tick.pair.clone(), self.clock.today()),
            FxUpsert {
                pair: tick.pair.clone(),
                rate_date: self.clock.today(),
                source: tick.source,
                rate: tick.rate,
                forward_points: tick.forward_points,
            },
        );
        Ok(())
    }

    /// Compute one (account, product) revaluation and enqueue it for
    /// conflated emission.
    async fn revalue(&self, account_id: i64, product_id: i64, price: Decimal, price_stale: bool) {
        let now = self.clock.now_millis();
        let quantity = match self.positions.get_quantity_as_of(account_id, product_id, now) {
            Ok(Some(q)) if !q.is_zero() => q,
            Ok(_) => return,
            Err(err) => {
                warn!(account_id, product_id, error = %err, "revaluation read failed");
                return;
            }
        };

        let base_currency = match self.refdata.get_account(account_id) {
            Ok(Some(account)) => account.base_currency,
            _ => self.cfg.pivot_currency.clone(),
        };
        let issue_currency = match self.refdata.get_product(product_id) {
            Ok(Some(product)) => product.issue_currency,
            _ => base_currency.clone(),
        };
        let fx = self.fx.rate_or_identity(&issue_currency, &base_currency).await;

        let market_value_local = quantity * price;
        let update = RevaluationUpdate {
            account_id,
            product_id,
            quantity,
            price,
            fx_rate: fx.rate,
            market_value_local,
            market_value_base: market_value_local * fx.rate,
            stale_inputs: price_stale || fx.stale,
            ts: now,
        };
        if update.stale_inputs {
            metrics::counter!("stale_valuation_inputs_total", 1);
        }
        self.conflation.enqueue(update);
        self.stats.revaluations_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    // =========================================================================
    // POSITION CHANGE EVENTS
    // =========================================================================

    /// May arrive via fabric, the direct channel, or both.
    pub fn handle_position_event(&self, event: &PositionChangeEvent) -> Result<()> {
        {
            let mut seen = self.seen_events.lock();
            if seen.len() > 16_384 {
                seen.clear();
            }
            if !seen.insert((event.account_id, event.event_type, event.ts)) {
                self.stats.events_deduped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        let keys = self.positions.current_position_keys(event.account_id)?;
        self.reverse_index.sync_account(event.account_id, keys);
        self.stats.index_syncs.fetch_add(1, Ordering::Relaxed);

        match event.event_type {
            PositionEventType::EodComplete
            | PositionEventType::ManualUpload
            | PositionEventType::CacheInvalidate => {
                self.symbology.reload(self.refdata.ticker_map()?);
            }
            PositionEventType::Intraday | PositionEventType::EodFailed => {}
        }
        Ok(())
    }

    // =========================================================================
    // FLUSH LOOPS
    // =========================================================================

    /// Emit everything conflated since the last flush.
    pub fn flush_conflation(&self) -> usize {
        let updates = self.conflation.drain();
        let count = updates.len();
        for update in updates {
            self.hub.publish(update);
        }
        self.stats
            .revaluations_emitted
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Throttled coalesced write of dirty price/FX rows to the database.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let prices: Vec<PriceUpsert> = self.dirty_prices.lock().drain().map(|(_, v)| v).collect();
        let rates: Vec<FxUpsert> = self.dirty_fx.lock().drain().map(|(_, v)| v).collect();
        if prices.is_empty() && rates.is_empty() {
            return Ok(0);
        }
        let store = self.price_store.clone();
        let prices = Arc::new(prices);
        let rates = Arc::new(rates);
        self.guards
            .database
            .call(move || {
                let store = store.clone();
                let prices = prices.clone();
                let rates = rates.clone();
                async move { store.flush(&prices, &rates) }
            })
            .await
    }

    // =========================================================================
    // WIRING
    // =========================================================================

    /// Spawn tick consumers, the position-event consumer, the optional
    /// direct notification listener, and the two flush loops.
    pub fn spawn(
        self: &Arc<Self>,
        shutdown: ShutdownSignal,
        direct_rx: Option<mpsc::UnboundedReceiver<PositionChangeEvent>>,
    ) -> Vec<JoinHandle<()>> {
        let retry = RetryPolicy::from_policy(&self.cfg.dependencies.messaging);
        let mut handles = Vec::new();

        let service = self.clone();
        handles.extend(crate::fabric::spawn_consumers(
            self.broker.clone(),
            topics::MARKET_DATA_TICKS,
            retry,
            shutdown.clone(),
            move |envelope: Envelope| {
                let service = service.clone();
                async move {
                    let tick: PriceTick = envelope.decode()?;
                    service.handle_price_tick(&tick).await
                }
            },
        ));

        let service = self.clone();
        handles.extend(crate::fabric::spawn_consumers(
            self.broker.clone(),
            topics::FX_RATES_TICKS,
            retry,
            shutdown.clone(),
            move |envelope: Envelope| {
                let service = service.clone();
                async move {
                    let tick: FxRateTick = envelope.decode()?;
                    service.handle_fx_tick(&tick).await
                }
            },
        ));

        let service = self.clone();
        handles.extend(crate::fabric::spawn_consumers(
            self.broker.clone(),
            topics::POSITION_CHANGE_EVENTS,
            retry,
            shutdown.clone(),
            move |envelope: Envelope| {
                let service = service.clone();
                async move {
                    let event: PositionChangeEvent = envelope.decode()?;
                    service.handle_position_event(&event)
                }
            },
        ));

        if let Some(mut rx) = direct_rx {
            let service = self.clone();
            let mut direct_shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = direct_shutdown.wait() => break,
                        next = rx.recv() => {
                            let Some(event) = next else { break };
                            if let Err(err) = service.handle_position_event(&event) {
                                warn!(error = %err, "direct notification handling failed");
                            }
                        }
                    }
                }
            }));
        }

        // Conflation flush loop
        let service = self.clone();
        let mut flush_shutdown = shutdown.clone();
        let conflation_interval = self.cfg.conflation_flush_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(conflation_interval);
            loop {
                tokio::select! {
                    _ = flush_shutdown.wait() => {
                        service.flush_conflation();
                        break;
                    }
                    _ = ticker.tick() => {
                        service.flush_conflation();
                    }
                }
            }
        }));

        // Dirty-row DB flush loop
        let service = self.clone();
        let mut db_shutdown = shutdown;
        let db_interval = self.cfg.price_flush_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(db_interval);
            loop {
                tokio::select! {
                    _ = db_shutdown.wait() => {
                        if let Err(err) = service.flush_dirty().await {
                            warn!(error = %err, "final dirty flush failed");
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = service.flush_dirty().await {
                            warn!(error = %err, "dirty flush failed");
                        }
                    }
                }
            }
        }));

        handles
    }
}
