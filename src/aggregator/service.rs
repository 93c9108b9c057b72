//! Trade Aggregator
//!
//! Per-order fill state machine: dedup on execution id, append to the fills
//! log, accumulate quantity and notional in the short-term KV state, mirror
//! into the durable summary, and on completion publish the synthetic
//! intraday trade event with the order's VWAP.
//!
//! Ordering: all reports for one client order id arrive on one partition
//! and are processed in order. Terminal orders reject late fills.

use crate::cache::IdempotencyStore;
use crate::clock::{Millis, SharedClock};
use crate::config::Config;
use crate::errors::{PlatformError, Result};
use crate::fabric::{topics, Broker, Envelope};
use crate::kv::KvStore;
use crate::models::{
    round_qty, round_vwap, AssetClass, ExecutionReport, ForwardContract, IntradayTradeEvent,
    OrderStatus, Side,
};
use crate::resilience::{DependencyGuards, RetryPolicy};
use crate::shutdown::ShutdownSignal;
use crate::store::{FillStore, OrderSummary};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Short-term order lifecycle state, held in the KV store under
/// `order:{client_order_id}` with a TTL. Loss of this state only forces a
/// replay from the fills log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderState {
    pub client_order_id: String,
    pub account_id: i64,
    pub ticker: String,
    pub asset_class: AssetClass,
    pub side: Side,
    pub filled_qty: Decimal,
    pub notional: Decimal,
    pub fill_count: u64,
    pub status: OrderStatus,
    pub created_at: Millis,
    pub updated_at: Millis,
}

pub fn order_state_key(client_order_id: &str) -> String {
    format!("order:{client_order_id}")
}

#[derive(Debug, Default)]
pub struct AggregatorStats {
    pub reports_processed: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub late_fills_rejected: AtomicU64,
    pub orders_completed: AtomicU64,
    pub forwards_created: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatorStatsSnapshot {
    pub reports_processed: u64,
    pub duplicates_dropped: u64,
    pub late_fills_rejected: u64,
    pub orders_completed: u64,
    pub forwards_created: u64,
}

impl AggregatorStats {
    pub fn snapshot(&self) -> AggregatorStatsSnapshot {
        AggregatorStatsSnapshot {
            reports_processed: self.reports_processed.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            late_fills_rejected: self.late_fills_rejected.load(Ordering::Relaxed),
            orders_completed: self.orders_completed.load(Ordering::Relaxed),
            forwards_created: self.forwards_created.load(Ordering::Relaxed),
        }
    }
}

pub struct TradeAggregator {
    cfg: Arc<Config>,
    clock: SharedClock,
    broker: Arc<Broker>,
    kv: Arc<dyn KvStore>,
    fills: Arc<FillStore>,
    exec_refs: Arc<IdempotencyStore>,
    guards: Arc<DependencyGuards>,
    stats: AggregatorStats,
}

impl TradeAggregator {
    pub fn new(
        cfg: Arc<Config>,
        clock: SharedClock,
        broker: Arc<Broker>,
        kv: Arc<dyn KvStore>,
        fills: Arc<FillStore>,
        exec_refs: Arc<IdempotencyStore>,
        guards: Arc<DependencyGuards>,
    ) -> Self {
        Self {
            cfg,
            clock,
            broker,
            kv,
            fills,
            exec_refs,
            guards,
            stats: AggregatorStats::default(),
        }
    }

    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }

    /// Process one execution report end to end.
    pub async fn handle_report(&self, report: &ExecutionReport) -> Result<()> {
        self.stats.reports_processed.fetch_add(1, Ordering::Relaxed);
        if report.last_qty.is_sign_negative() {
            return Err(PlatformError::Validation {
                field: "last_qty".into(),
                reason: format!("negative fill quantity {}", report.last_qty),
            });
        }

        // 1. fast dedup on execution id
        if !self.exec_refs.check_and_mark(&report.exec_id).await {
            self.stats.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
            info!(exec_id = %report.exec_id, "duplicate execution report dropped");
            return Ok(());
        }

        // 2. terminal orders accept no further fills
        if let Some(summary) = self.fills.get_order_summary(&report.client_order_id)? {
            if summary.status.is_terminal() {
                self.stats.late_fills_rejected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("late_fills_rejected_total", 1);
                warn!(
                    client_order_id = %report.client_order_id,
                    exec_id = %report.exec_id,
                    status = summary.status.as_str(),
                    "late fill for terminal order logged, not applied"
                );
                return Ok(());
            }
        }

        let now = self.clock.now_millis();

        // 3. durable append; the unique constraint is the on-disk dedup
        let inserted = {
            let fills = self.fills.clone();
            let report_clone = report.clone();
            self.guards
                .database
                .call(move || {
                    let fills = fills.clone();
                    let report = report_clone.clone();
                    async move { fills.insert_fill(&report, now) }
                })
                .await?
        };
        if !inserted {
            self.stats.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(exec_id = %report.exec_id, "fill already persisted, dropped");
            return Ok(());
        }

        // 4. load-or-init short-term state and accumulate. An absent state
        // starts from zero; a lost KV store is recovered by replaying the
        // fills log, never by guessing
        let key = order_state_key(&report.client_order_id);
        let mut state = match self.kv.get(&key).await {
            Ok(Some(raw)) => serde_json::from_str::<OrderState>(&raw)
                .map_err(|e| PlatformError::Parse(e.to_string()))?,
            Ok(None) => self.init_state(report, now),
            Err(err) => {
                warn!(error = %err, "order state unavailable, starting fresh accumulation");
                self.init_state(report, now)
            }
        };

        state.filled_qty = round_qty(state.filled_qty + report.last_qty);
        state.notional += report.last_qty * report.last_px;
        state.fill_count += 1;
        state.status = derive_status(report.status, state.filled_qty);
        state.updated_at = now;

        // 5. persist state with TTL, mirror into the durable summary
        match serde_json::to_string(&state) {
            Ok(raw) => {
                if let Err(err) = self.kv.put(&key, &raw, self.cfg.order_state_ttl).await {
                    warn!(error = %err, "order state write failed, summary remains durable");
                }
            }
            Err(err) => warn!(error = %err, "order state encode failed"),
        }
        self.upsert_summary(&state, report, None).await?;

        // 6. completion
        let completed =
            report.status.is_terminal() || state.fill_count >= self.cfg.fill_count_cap;
        if completed {
            self.complete_order(&state, report, now).await?;
        }
        Ok(())
    }

    fn init_state(&self, report: &ExecutionReport, now: Millis) -> OrderState {
        OrderState {
            client_order_id: report.client_order_id.clone(),
            account_id: report.account_id,
            ticker: report.ticker.clone(),
            asset_class: report.asset_class,
            side: report.side,
            filled_qty: Decimal::ZERO,
            notional: Decimal::ZERO,
            fill_count: 0,
            status: OrderStatus::New,
            created_at: now,
            updated_at: now,
        }
    }

    async fn upsert_summary(
        &self,
        state: &OrderState,
        report: &ExecutionReport,
        vwap: Option<Decimal>,
    ) -> Result<()> {
        let summary = OrderSummary {
            client_order_id: state.client_order_id.clone(),
            external_order_id: report.external_order_id.clone(),
            account_id: state.account_id,
            ticker: state.ticker.clone(),
            side: state.side,
            filled_qty: state.filled_qty,
            notional: state.notional,
            fill_count: state.fill_count as i64,
            status: state.status,
            vwap,
            updated_at: state.updated_at,
        };
        let fills = self.fills.clone();
        let summary = Arc::new(summary);
        self.guards
            .database
            .call(move || {
                let fills = fills.clone();
                let summary = summary.clone();
                async move { fills.upsert_order_summary(&summary) }
            })
            .await
    }

    async fn complete_order(
        &self,
        state: &OrderState,
        report: &ExecutionReport,
        now: Millis,
    ) -> Result<()> {
        let vwap = if state.filled_qty.is_zero() {
            Decimal::ZERO
        } else {
            round_vwap(state.notional / state.filled_qty)
        };

        let mut final_state = state.clone();
        final_state.status = derive_status(report.status, state.filled_qty);
        self.upsert_summary(&final_state, report, Some(vwap)).await?;

        if report.asset_class == AssetClass::FxForward
            && final_state.status == OrderStatus::Filled
        {
            if let Some(maturity_date) = report.maturity_date {
                let contract = ForwardContract {
                    client_order_id: state.client_order_id.clone(),
                    account_id: state.account_id,
                    currency_pair: state.ticker.clone(),
                    notional: state.filled_qty,
                    forward_rate: vwap,
                    maturity_date,
                    created_at: now,
                };
                self.fills.insert_forward(&contract)?;
                self.stats.forwards_created.fetch_add(1, Ordering::Relaxed);
            }
        }

        let event = IntradayTradeEvent {
            account_id: state.account_id,
            client_order_id: state.client_order_id.clone(),
            product_id: None,
            ticker: state.ticker.clone(),
            side: state.side,
            filled_qty: state.filled_qty,
            vwap,
            ts: now,
        };
        {
            let broker = self.broker.clone();
            let key = state.account_id.to_string();
            let event = event.clone();
            self.guards
                .messaging
                .call(move || {
                    let broker = broker.clone();
                    let key = key.clone();
                    let event = event.clone();
                    async move {
                        broker
                            .publish(topics::INTRADAY_TRADE_EVENTS, &key, &event)
                            .await
                    }
                })
                .await?;
        }

        // short-term state removed on completion
        if let Err(err) = self.kv.delete(&order_state_key(&state.client_order_id)).await {
            warn!(error = %err, "order state delete failed, TTL will reap it");
        }
        self.stats.orders_completed.fetch_add(1, Ordering::Relaxed);
        info!(
            client_order_id = %state.client_order_id,
            filled_qty = %state.filled_qty,
            %vwap,
            status = final_state.status.as_str(),
            "order completed"
        );
        Ok(())
    }

    /// Warn on forward contracts maturing within the configured horizon.
    /// Returns the number of contracts flagged.
    pub fn forward_maturity_scan(&self) -> Result<usize> {
        let horizon = self.clock.today()
            + chrono::Days::new(self.cfg.forward_maturity_horizon_days.max(0) as u64);
        let maturing = self.fills.forwards_maturing_by(horizon)?;
        for contract in &maturing {
            metrics::counter!("forward_maturity_alerts_total", 1);
            warn!(
                client_order_id = %contract.client_order_id,
                account_id = contract.account_id,
                maturity = %contract.maturity_date,
                notional = %contract.notional,
                "forward contract approaching maturity"
            );
        }
        Ok(maturing.len())
    }

    /// Spawn the execution-report consumers.
    pub fn spawn_consumers(self: &Arc<Self>, shutdown: ShutdownSignal) -> Vec<JoinHandle<()>> {
        let retry = RetryPolicy::from_policy(&self.cfg.dependencies.messaging);
        let aggregator = self.clone();
        crate::fabric::spawn_consumers(
            self.broker.clone(),
            topics::RAW_EXECUTION_REPORTS,
            retry,
            shutdown,
            move |envelope: Envelope| {
                let aggregator = aggregator.clone();
                async move {
                    let report: ExecutionReport = envelope.decode()?;
                    aggregator.handle_report(&report).await
                }
            },
        )
    }
}

/// NEW until something fills, then PARTIALLY_FILLED, unless the report
/// itself carries a terminal status.
fn derive_status(report_status: OrderStatus, filled_qty: Decimal) -> OrderStatus {
    match report_status {
        OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Canceled => report_status,
        _ => {
            if filled_qty > Decimal::ZERO {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::New
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::fabric::register_platform_topics;
    use crate::kv::InMemoryKv;
    use crate::store::Database;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::sync::mpsc;

    pub(crate) struct Harness {
        pub aggregator: Arc<TradeAggregator>,
        pub kv: Arc<InMemoryKv>,
        pub fills: Arc<FillStore>,
        pub clock: Arc<ManualClock>,
        pub trade_rx: Vec<mpsc::Receiver<Envelope>>,
    }

    pub(crate) fn harness() -> Harness {
        let mut cfg = Config::default();
        cfg.dependencies.database.retry_base_wait = Duration::from_millis(1);
        cfg.dependencies.messaging.retry_base_wait = Duration::from_millis(1);
        let cfg = Arc::new(cfg);
        let clock = Arc::new(ManualClock::new(1_705_320_000_000));
        let db = Database::open_in_memory().unwrap();
        let kv = Arc::new(InMemoryKv::new(clock.clone()));
        let broker = Arc::new(Broker::new());
        register_platform_topics(&broker);
        let trade_rx = broker.take_receivers(topics::INTRADAY_TRADE_EVENTS).unwrap();

        let fills = Arc::new(FillStore::new(db));
        let exec_refs = Arc::new(IdempotencyStore::new(
            kv.clone(),
            "fill",
            Duration::from_secs(24 * 3600),
        ));
        let guards = Arc::new(DependencyGuards::from_config(&cfg, clock.clone()));
        let aggregator = Arc::new(TradeAggregator::new(
            cfg,
            clock.clone(),
            broker,
            kv.clone(),
            fills.clone(),
            exec_refs,
            guards,
        ));
        Harness {
            aggregator,
            kv,
            fills,
            clock,
            trade_rx,
        }
    }

    pub(crate) fn report(
        exec_id: &str,
        order_id: &str,
        qty: Decimal,
        px: Decimal,
        status: OrderStatus,
    ) -> ExecutionReport {
        ExecutionReport {
            exec_id: exec_id.into(),
            client_order_id: order_id.into(),
            external_order_id: Some(format!("EXT-{order_id}")),
            account_id: 1001,
            ticker: "EUR/USD".into(),
            asset_class: AssetClass::FxSpot,
            side: Side::Buy,
            last_qty: qty,
            last_px: px,
            cum_qty: qty,
            status,
            maturity_date: None,
            ts: 1_705_320_000_000,
        }
    }

    fn drain_events(harness: &mut Harness) -> Vec<IntradayTradeEvent> {
        let mut events = Vec::new();
        for rx in harness.trade_rx.iter_mut() {
            while let Ok(envelope) = rx.try_recv() {
                events.push(envelope.decode::<IntradayTradeEvent>().unwrap());
            }
        }
        events
    }

    #[tokio::test]
    async fn test_fill_aggregation_and_vwap() {
        let mut harness = harness();
        let fills = [
            ("E1", dec!(30), dec!(1.0540), OrderStatus::PartiallyFilled),
            ("E2", dec!(50), dec!(1.0545), OrderStatus::PartiallyFilled),
            ("E3", dec!(20), dec!(1.0530), OrderStatus::Filled),
        ];
        for (exec_id, qty, px, status) in fills {
            harness
                .aggregator
                .handle_report(&report(exec_id, "ORD-7", qty, px, status))
                .await
                .unwrap();
        }

        assert_eq!(harness.fills.fill_count("ORD-7").unwrap(), 3);
        let summary = harness.fills.get_order_summary("ORD-7").unwrap().unwrap();
        assert_eq!(summary.filled_qty, dec!(100));
        assert_eq!(summary.status, OrderStatus::Filled);
        // (30*1.0540 + 50*1.0545 + 20*1.0530) / 100 = 1.05405
        assert_eq!(summary.vwap, Some(dec!(1.05405000)));

        let events = drain_events(&mut harness);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].filled_qty, dec!(100));
        assert_eq!(events[0].vwap, dec!(1.05405000));

        // short-term state removed
        assert!(harness
            .kv
            .get(&order_state_key("ORD-7"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_exec_id_dropped() {
        let mut harness = harness();
        let fill = report("E1", "ORD-8", dec!(10), dec!(1.05), OrderStatus::PartiallyFilled);
        harness.aggregator.handle_report(&fill).await.unwrap();
        harness.aggregator.handle_report(&fill).await.unwrap();

        assert_eq!(harness.fills.fill_count("ORD-8").unwrap(), 1);
        let summary = harness.fills.get_order_summary("ORD-8").unwrap().unwrap();
        assert_eq!(summary.filled_qty, dec!(10));
        assert_eq!(
            harness
                .aggregator
                .stats()
                .duplicates_dropped
                .load(Ordering::Relaxed),
            1
        );
        assert!(drain_events(&mut harness).is_empty());
    }

    #[tokio::test]
    async fn test_on_disk_dedup_survives_kv_loss() {
        let mut harness = harness();
        let fill = report("E1", "ORD-9", dec!(10), dec!(1.05), OrderStatus::PartiallyFilled);
        harness.aggregator.handle_report(&fill).await.unwrap();

        // KV wiped: the idempotency fast path forgets the exec id
        for (key, _) in harness.kv.scan_prefix("").await.unwrap() {
            harness.kv.delete(&key).await.unwrap();
        }

        harness.aggregator.handle_report(&fill).await.unwrap();
        // The unique constraint caught it
        assert_eq!(harness.fills.fill_count("ORD-9").unwrap(), 1);
        assert!(drain_events(&mut harness).is_empty());
    }

    #[tokio::test]
    async fn test_terminal_order_rejects_late_fills() {
        let mut harness = harness();
        harness
            .aggregator
            .handle_report(&report("E1", "ORD-10", dec!(100), dec!(1.05), OrderStatus::Filled))
            .await
            .unwrap();
        drain_events(&mut harness);

        harness
            .aggregator
            .handle_report(&report(
                "E2",
                "ORD-10",
                dec!(5),
                dec!(1.06),
                OrderStatus::PartiallyFilled,
            ))
            .await
            .unwrap();

        let summary = harness.fills.get_order_summary("ORD-10").unwrap().unwrap();
        assert_eq!(summary.filled_qty, dec!(100)); // unchanged
        assert_eq!(
            harness
                .aggregator
                .stats()
                .late_fills_rejected
                .load(Ordering::Relaxed),
            1
        );
        assert!(drain_events(&mut harness).is_empty());
    }

    #[tokio::test]
    async fn test_zero_filled_rejected_order_reports_zero_vwap() {
        let mut harness = harness();
        harness
            .aggregator
            .handle_report(&report("E1", "ORD-11", dec!(0), dec!(0), OrderStatus::Rejected))
            .await
            .unwrap();
        let summary = harness.fills.get_order_summary("ORD-11").unwrap().unwrap();
        assert_eq!(summary.status, OrderStatus::Rejected);
        assert_eq!(summary.vwap, Some(dec!(0)));
        let events = drain_events(&mut harness);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].vwap, dec!(0));
    }

    #[tokio::test]
    async fn test_filled_qty_monotonic_across_reports() {
        let harness = harness();
        let mut last = Decimal::ZERO;
        for (i, qty) in [dec!(10), dec!(0), dec!(25)].iter().enumerate() {
            harness
                .aggregator
                .handle_report(&report(
                    &format!("E{i}"),
                    "ORD-12",
                    *qty,
                    dec!(1.05),
                    OrderStatus::PartiallyFilled,
                ))
                .await
                .unwrap();
            let summary = harness.fills.get_order_summary("ORD-12").unwrap().unwrap();
            assert!(summary.filled_qty >= last);
            last = summary.filled_qty;
        }
        assert_eq!(last, dec!(35));
    }

    #[tokio::test]
    async fn test_forward_fill_creates_contract() {
        let mut harness = harness();
        let mut fwd = report("E1", "ORD-13", dec!(1000000), dec!(1.06), OrderStatus::Filled);
        fwd.asset_class = AssetClass::FxForward;
        fwd.maturity_date = chrono::NaiveDate::from_ymd_opt(2024, 4, 15);
        harness.aggregator.handle_report(&fwd).await.unwrap();

        let forwards = harness.fills.forwards_for_account(1001).unwrap();
        assert_eq!(forwards.len(), 1);
        assert_eq!(forwards[0].notional, dec!(1000000));
        assert_eq!(forwards[0].forward_rate, dec!(1.06000000));
        assert_eq!(
            forwards[0].maturity_date,
            chrono::NaiveDate::from_ymd_opt(2024, 4, 15).unwrap()
        );
        drain_events(&mut harness);
    }

    #[tokio::test]
    async fn test_forward_maturity_scan_flags_near_contracts() {
        let mut harness = harness();
        let today = harness.clock.today();
        for (id, days) in [("F-NEAR", 3u64), ("F-FAR", 90)] {
            let mut fwd = report("E-", "x", dec!(1), dec!(1), OrderStatus::Filled);
            fwd.exec_id = format!("EXEC-{id}");
            fwd.client_order_id = id.into();
            fwd.asset_class = AssetClass::FxForward;
            fwd.maturity_date = Some(today + chrono::Days::new(days));
            harness.aggregator.handle_report(&fwd).await.unwrap();
        }
        // Default horizon is 7 days
        assert_eq!(harness.aggregator.forward_maturity_scan().unwrap(), 1);
        drain_events(&mut harness);
    }

    #[tokio::test]
    async fn test_fill_count_cap_completes_order() {
        let mut harness = harness();
        {
            // shrink the cap for the test
            let mut cfg = Config::default();
            cfg.fill_count_cap = 2;
            cfg.dependencies.database.retry_base_wait = Duration::from_millis(1);
            let clock = harness.clock.clone();
            let db = Database::open_in_memory().unwrap();
            let kv = Arc::new(InMemoryKv::new(clock.clone()));
            let broker = Arc::new(Broker::new());
            register_platform_topics(&broker);
            let mut trade_rx = broker.take_receivers(topics::INTRADAY_TRADE_EVENTS).unwrap();
            let fills = Arc::new(FillStore::new(db));
            let aggregator = Arc::new(TradeAggregator::new(
                Arc::new(cfg),
                clock.clone(),
                broker,
                kv,
                fills.clone(),
                Arc::new(IdempotencyStore::new(
                    Arc::new(InMemoryKv::new(clock.clone())),
                    "fill",
                    Duration::from_secs(60),
                )),
                Arc::new(DependencyGuards::from_config(&Config::default(), clock)),
            ));

            for i in 0..2 {
                aggregator
                    .handle_report(&report(
                        &format!("E{i}"),
                        "ORD-14",
                        dec!(10),
                        dec!(1.05),
                        OrderStatus::PartiallyFilled,
                    ))
                    .await
                    .unwrap();
            }
            let summary = fills.get_order_summary("ORD-14").unwrap().unwrap();
            assert_eq!(summary.vwap, Some(dec!(1.05000000)));
            let event = trade_rx[0].try_recv().unwrap();
            let event: IntradayTradeEvent = event.decode().unwrap();
            assert_eq!(event.filled_qty, dec!(20));
        }
        drain_events(&mut harness);
    }
}
