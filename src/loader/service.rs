//! Position Loader
//!
//! Orchestrates EOD per account under a per-account lock: fetch upstream
//! snapshot, validate, reserve a batch, insert, activate, mark COMPLETED,
//! publish the change event, then check client sign-off. A failure leaves
//! the prior active batch untouched and marks the status FAILED.
//!
//! Intraday records and the aggregator's synthetic trade events flow into
//! the active batch through the same bitemporal upsert, deduplicated by
//! their external references.

use crate::cache::IdempotencyStore;
use crate::clock::SharedClock;
use crate::config::Config;
use crate::errors::{PlatformError, Result};
use crate::fabric::{topics, Broker, Envelope};
use crate::loader::signoff::SignoffPublisher;
use crate::loader::validation;
use crate::loader::PositionFeed;
use crate::models::{
    round_price, round_qty, AccountSnapshot, EodTrigger, IntradayTradeEvent, Position,
    PositionChangeEvent, PositionEventType, PositionType, SnapshotPosition,
};
use crate::pricing::fx::FxConverter;
use crate::resilience::{DependencyGuards, RetryPolicy};
use crate::shutdown::ShutdownSignal;
use crate::store::{AuditStore, EodStatus, EodStore, PositionStore, RefDataStore};
use chrono::NaiveDate;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Business-time "forever" for snapshot rows.
fn open_business_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(9999, 12, 31).expect("valid date")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EodOutcome {
    Completed {
        batch_id: i64,
        position_count: usize,
    },
    /// Re-invocation for an already COMPLETED (account, date).
    AlreadyCompleted,
    /// Manual upload identical to the active batch.
    NoChange,
}

#[derive(Debug, Default)]
pub struct LoaderStats {
    pub eod_completed: AtomicU64,
    pub eod_failed: AtomicU64,
    pub intraday_applied: AtomicU64,
    pub intraday_duplicates: AtomicU64,
    pub trade_events_applied: AtomicU64,
    pub shard_skipped: AtomicU64,
    pub deadline_missed: AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoaderStatsSnapshot {
    pub eod_completed: u64,
    pub eod_failed: u64,
    pub intraday_applied: u64,
    pub intraday_duplicates: u64,
    pub trade_events_applied: u64,
    pub shard_skipped: u64,
    pub deadline_missed: bool,
}

impl LoaderStats {
    pub fn snapshot(&self) -> LoaderStatsSnapshot {
        LoaderStatsSnapshot {
            eod_completed: self.eod_completed.load(Ordering::Relaxed),
            eod_failed: self.eod_failed.load(Ordering::Relaxed),
            intraday_applied: self.intraday_applied.load(Ordering::Relaxed),
            intraday_duplicates: self.intraday_duplicates.load(Ordering::Relaxed),
            trade_events_applied: self.trade_events_applied.load(Ordering::Relaxed),
            shard_skipped: self.shard_skipped.load(Ordering::Relaxed),
            deadline_missed: self.deadline_missed.load(Ordering::Relaxed),
        }
    }
}

pub struct PositionLoader {
    cfg: Arc<Config>,
    clock: SharedClock,
    broker: Arc<Broker>,
    positions: Arc<PositionStore>,
    eod: Arc<EodStore>,
    refdata: Arc<RefDataStore>,
    audit: Arc<AuditStore>,
    feed: Arc<dyn PositionFeed>,
    fx: Arc<FxConverter>,
    intraday_refs: Arc<IdempotencyStore>,
    guards: Arc<DependencyGuards>,
    signoff: SignoffPublisher,
    eod_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    direct_tx: Mutex<Option<mpsc::UnboundedSender<PositionChangeEvent>>>,
    stats: LoaderStats,
}

impl PositionLoader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<Config>,
        clock: SharedClock,
        broker: Arc<Broker>,
        positions: Arc<PositionStore>,
        eod: Arc<EodStore>,
        refdata: Arc<RefDataStore>,
        audit: Arc<AuditStore>,
        feed: Arc<dyn PositionFeed>,
        fx: Arc<FxConverter>,
        intraday_refs: Arc<IdempotencyStore>,
        guards: Arc<DependencyGuards>,
    ) -> Self {
        let signoff = SignoffPublisher::new(eod.clone(), audit.clone(), broker.clone(), clock.clone());
        Self {
            cfg,
            clock,
            broker,
            positions,
            eod,
            refdata,
            audit,
            feed,
            fx,
            intraday_refs,
            guards,
            signoff,
            eod_locks: Mutex::new(HashMap::new()),
            direct_tx: Mutex::new(None),
            stats: LoaderStats::default(),
        }
    }

    /// Attach the best-effort synchronous notification channel (the
    /// out-of-band delivery path; the fabric remains the fallback).
    pub fn set_direct_notifier(&self, tx: mpsc::UnboundedSender<PositionChangeEvent>) {
        *self.direct_tx.lock() = Some(tx);
    }

    pub fn stats(&self) -> &LoaderStats {
        &self.stats
    }

    fn account_lock(&self, account_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.eod_locks
            .lock()
            .entry(account_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // =========================================================================
    // EOD
    // =========================================================================

    /// Run EOD for one account. Idempotent per (account, business date):
    /// a re-invocation observes COMPLETED and returns.
    pub async fn run_eod(&self, account_id: i64, business_date: NaiveDate) -> Result<EodOutcome> {
        if !self.cfg.owns_account(account_id) {
            return Err(PlatformError::ShardMismatch(account_id));
        }
        let lock = self.account_lock(account_id);
        let _held = lock.lock().await;

        if let Some(row) = self.eod.get_status(account_id, business_date)? {
            if row.status == EodStatus::Completed {
                info!(account_id, %business_date, "EOD already completed");
                return Ok(EodOutcome::AlreadyCompleted);
            }
        }
        let now = self.clock.now_millis();
        self.eod
            .transition(account_id, business_date, EodStatus::InProgress, None, None, now)?;

        let feed = self.feed.clone();
        let fetched = self
            .guards
            .upstream_feed
            .call(move || {
                let feed = feed.clone();
                async move { feed.fetch_snapshot(account_id, business_date).await }
            })
            .await;

        let result = match fetched {
            Ok(snapshot) => {
                self.process_snapshot(
                    &snapshot,
                    business_date,
                    "MSPM",
                    "system",
                    PositionEventType::EodComplete,
                )
                .await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(outcome) => {
                self.stats.eod_completed.fetch_add(1, Ordering::Relaxed);
                Ok(outcome)
            }
            Err(err) => {
                self.fail_eod(account_id, business_date, &err).await;
                Err(err)
            }
        }
    }

    /// Manual upload: externally supplied snapshot with an audit actor.
    /// A snapshot identical to the active batch is a no-op.
    pub async fn manual_upload(
        &self,
        snapshot: &AccountSnapshot,
        business_date: NaiveDate,
        actor: &str,
    ) -> Result<EodOutcome> {
        if !self.cfg.owns_account(snapshot.account_id) {
            return Err(PlatformError::ShardMismatch(snapshot.account_id));
        }
        let lock = self.account_lock(snapshot.account_id);
        let _held = lock.lock().await;

        let now = self.clock.now_millis();
        let result = self
            .process_snapshot(
                snapshot,
                business_date,
                "MANUAL",
                actor,
                PositionEventType::ManualUpload,
            )
            .await;
        match &result {
            Ok(outcome) => {
                self.audit.record(
                    actor,
                    "MANUAL_UPLOAD",
                    Some(snapshot.account_id),
                    &format!("{outcome:?}"),
                    now,
                )?;
            }
            Err(err) => {
                self.audit.record(
                    actor,
                    "MANUAL_UPLOAD_FAILED",
                    Some(snapshot.account_id),
                    err.code(),
                    now,
                )?;
            }
        }
        result
    }

    async fn fail_eod(&self, account_id: i64, business_date: NaiveDate, err: &PlatformError) {
        self.stats.eod_failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("eod_failed_total", 1);
        error!(account_id, %business_date, code = err.code(), error = %err, "EOD failed");

        let now = self.clock.now_millis();
        if let Err(status_err) = self.eod.transition(
            account_id,
            business_date,
            EodStatus::Failed,
            None,
            Some(&err.to_string()),
            now,
        ) {
            error!(account_id, error = %status_err, "could not mark EOD FAILED");
        }
        let client_id = self
            .refdata
            .get_account(account_id)
            .ok()
            .flatten()
            .map(|a| a.client_id)
            .unwrap_or(0);
        if let Err(publish_err) = self
            .publish_change(account_id, client_id, PositionEventType::EodFailed)
            .await
        {
            error!(account_id, error = %publish_err, "could not publish EOD-failed event");
        }
        let _ = self
            .audit
            .record("system", "EOD_FAILED", Some(account_id), err.code(), now);
    }

    async fn process_snapshot(
        &self,
        snapshot: &AccountSnapshot,
        business_date: NaiveDate,
        source_system: &str,
        actor: &str,
        event_type: PositionEventType,
    ) -> Result<EodOutcome> {
        validation::validate_header(snapshot)?;
        let total = snapshot.positions.len();
        let outcome = validation::validate_rows(&snapshot.positions);
        if outcome.rejected_ratio(total) > self.cfg.validation_error_threshold {
            return Err(PlatformError::SnapshotRejected {
                rejected: outcome.rejected.len(),
                total,
            });
        }
        for (idx, err) in &outcome.rejected {
            warn!(
                account_id = snapshot.account_id,
                row = *idx,
                code = err.code(),
                "snapshot row rejected"
            );
        }

        let account_id = snapshot.account_id;
        self.refdata.upsert_account(&snapshot.account_info())?;
        for row in &outcome.valid {
            self.refdata.upsert_product_from_snapshot(row)?;
        }

        let mut rows = Vec::with_capacity(outcome.valid.len());
        for row in &outcome.valid {
            rows.push(
                self.build_position(snapshot, row, business_date, source_system)
                    .await,
            );
        }

        if event_type == PositionEventType::ManualUpload
            && self.matches_active_batch(account_id, business_date, &rows)?
        {
            info!(account_id, "manual upload identical to active batch, no-op");
            return Ok(EodOutcome::NoChange);
        }

        let rows = Arc::new(rows);
        let positions = self.positions.clone();

        let batch_id = {
            let positions = positions.clone();
            self.guards
                .database
                .call(move || {
                    let positions = positions.clone();
                    async move { positions.create_batch(account_id) }
                })
                .await?
        };
        let (inserted, rejected) = {
            let positions = positions.clone();
            let rows = rows.clone();
            self.guards
                .database
                .call(move || {
                    let positions = positions.clone();
                    let rows = rows.clone();
                    async move { positions.insert_positions(account_id, batch_id, &rows) }
                })
                .await?
        };
        if rejected > 0 {
            warn!(account_id, batch_id, rejected, "duplicate rows rejected in batch");
        }
        {
            let positions = positions.clone();
            self.guards
                .database
                .call(move || {
                    let positions = positions.clone();
                    async move { positions.activate_batch(account_id, batch_id) }
                })
                .await?;
        }

        let now = self.clock.now_millis();
        // Manual uploads may arrive without a prior trigger; pass the state
        // machine through IN_PROGRESS unless the day is already COMPLETED
        let current = self
            .eod
            .get_status(account_id, business_date)?
            .map(|r| r.status);
        if current != Some(EodStatus::Completed) {
            self.eod
                .transition(account_id, business_date, EodStatus::InProgress, None, None, now)?;
        }
        self.eod.transition(
            account_id,
            business_date,
            EodStatus::Completed,
            Some(inserted as i64),
            None,
            now,
        )?;
        self.publish_change(account_id, snapshot.client_id, event_type)
            .await?;
        self.audit.record(
            actor,
            "BATCH_ACTIVATED",
            Some(account_id),
            &format!("batch {batch_id}, {inserted} positions"),
            now,
        )?;
        info!(
            account_id,
            batch_id, inserted, %business_date, "EOD published"
        );

        self.signoff
            .maybe_signoff(snapshot.client_id, business_date)
            .await?;

        Ok(EodOutcome::Completed {
            batch_id,
            position_count: inserted,
        })
    }

    async fn build_position(
        &self,
        snapshot: &AccountSnapshot,
        row: &SnapshotPosition,
        business_date: NaiveDate,
        source_system: &str,
    ) -> Position {
        let fx = self
            .fx
            .rate_or_identity(&row.issue_currency, &snapshot.base_currency)
            .await;
        let quantity = round_qty(row.quantity);
        let price = round_price(row.price);
        let mv_local = quantity * price;
        let mv_base = mv_local * fx.rate;
        Position {
            account_id: snapshot.account_id,
            product_id: row.product_id,
            batch_id: 0, // assigned by the store
            business_date,
            quantity,
            price_used: price,
            fx_rate_used: fx.rate,
            market_value_local: mv_local,
            market_value_base: mv_base,
            cost_basis_local: mv_local,
            cost_basis_base: mv_base,
            unrealized_pnl_local: Decimal::ZERO,
            unrealized_pnl_base: Decimal::ZERO,
            source_system: source_system.to_string(),
            position_type: PositionType::parse(&row.txn_type).unwrap_or(PositionType::Physical),
            excluded: false,
            valid_from: business_date,
            valid_to: open_business_date(),
            system_from: 0,
            system_to: 0,
        }
    }

    /// Bit-identical replay detection: same (product, quantity, price) set
    /// as the current active batch.
    fn matches_active_batch(
        &self,
        account_id: i64,
        business_date: NaiveDate,
        rows: &[Position],
    ) -> Result<bool> {
        let current = self.positions.get_positions_as_of(account_id, business_date)?;
        if rows.is_empty() || current.len() != rows.len() {
            return Ok(false);
        }
        let mut incoming: Vec<(i64, Decimal, Decimal)> = rows
            .iter()
            .map(|r| (r.product_id, r.quantity, r.price_used))
            .collect();
        incoming.sort();
        let mut existing: Vec<(i64, Decimal, Decimal)> = current
            .iter()
            .map(|r| (r.product_id, r.quantity, r.price_used))
            .collect();
        existing.sort();
        Ok(incoming == existing)
    }

    // =========================================================================
    // INTRADAY
    // =========================================================================

    /// Apply an intraday snapshot: per-row dedup by externalRefId, then a
    /// bitemporal upsert into the active batch.
    pub async fn apply_intraday(&self, snapshot: &AccountSnapshot) -> Result<usize> {
        if !self.cfg.owns_account(snapshot.account_id) {
            return Err(PlatformError::ShardMismatch(snapshot.account_id));
        }
        validation::validate_header(snapshot)?;
        let total = snapshot.positions.len();
        let outcome = validation::validate_rows(&snapshot.positions);
        if outcome.rejected_ratio(total) > self.cfg.validation_error_threshold {
            return Err(PlatformError::SnapshotRejected {
                rejected: outcome.rejected.len(),
                total,
            });
        }

        let business_date = self.clock.today();
        let mut rows = Vec::new();
        for row in &outcome.valid {
            if let Some(ref_id) = &row.external_ref_id {
                if !self.intraday_refs.check_and_mark(ref_id).await {
                    self.stats.intraday_duplicates.fetch_add(1, Ordering::Relaxed);
                    info!(
                        account_id = snapshot.account_id,
                        ref_id = %ref_id,
                        "duplicate intraday record dropped"
                    );
                    continue;
                }
            }
            self.refdata.upsert_product_from_snapshot(row)?;
            rows.push(
                self.build_position(snapshot, row, business_date, "MSPA_INTRADAY")
                    .await,
            );
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let account_id = snapshot.account_id;
        let applied = {
            let positions = self.positions.clone();
            let rows = Arc::new(rows);
            self.guards
                .database
                .call(move || {
                    let positions = positions.clone();
                    let rows = rows.clone();
                    async move { positions.update_positions(account_id, &rows) }
                })
                .await?
        };
        self.stats
            .intraday_applied
            .fetch_add(applied as u64, Ordering::Relaxed);
        self.publish_change(account_id, snapshot.client_id, PositionEventType::Intraday)
            .await?;
        Ok(applied)
    }

    /// Apply one synthetic trade event from the aggregator as a signed
    /// position delta priced at the reported VWAP.
    pub async fn apply_trade_event(&self, event: &IntradayTradeEvent) -> Result<()> {
        if !self.cfg.owns_account(event.account_id) {
            return Err(PlatformError::ShardMismatch(event.account_id));
        }
        if event.filled_qty.is_zero() {
            // nothing filled (e.g. a straight reject); nothing to apply
            return Ok(());
        }
        let product_id = match event.product_id {
            Some(id) => id,
            None => self
                .refdata
                .product_id_for_ticker(&event.ticker)?
                .ok_or_else(|| PlatformError::Validation {
                    field: "ticker".into(),
                    reason: format!("unresolved ticker {}", event.ticker),
                })?,
        };

        let now = self.clock.now_millis();
        let current = self
            .positions
            .get_quantity_as_of(event.account_id, product_id, now)?
            .unwrap_or(Decimal::ZERO);
        let new_qty = round_qty(current + event.side.sign() * event.filled_qty);

        let account = self.refdata.get_account(event.account_id)?;
        let (client_id, base_currency) = account
            .map(|a| (a.client_id, a.base_currency))
            .unwrap_or((0, self.cfg.pivot_currency.clone()));
        let issue_currency = self
            .refdata
            .get_product(product_id)?
            .map(|p| p.issue_currency)
            .unwrap_or_else(|| base_currency.clone());
        let fx = self
            .fx
            .rate_or_identity(&issue_currency, &base_currency)
            .await;

        let price = round_price(event.vwap);
        let mv_local = new_qty * price;
        let row = Position {
            account_id: event.account_id,
            product_id,
            batch_id: 0,
            business_date: self.clock.today(),
            quantity: new_qty,
            price_used: price,
            fx_rate_used: fx.rate,
            market_value_local: mv_local,
            market_value_base: mv_local * fx.rate,
            cost_basis_local: mv_local,
            cost_basis_base: mv_local * fx.rate,
            unrealized_pnl_local: Decimal::ZERO,
            unrealized_pnl_base: Decimal::ZERO,
            source_system: "TRADE_AGGREGATOR".into(),
            position_type: PositionType::Synthetic,
            excluded: false,
            valid_from: self.clock.today(),
            valid_to: open_business_date(),
            system_from: 0,
            system_to: 0,
        };

        let account_id = event.account_id;
        {
            let positions = self.positions.clone();
            let row = Arc::new(vec![row]);
            self.guards
                .database
                .call(move || {
                    let positions = positions.clone();
                    let row = row.clone();
                    async move { positions.update_positions(account_id, &row) }
                })
                .await?;
        }
        self.stats.trade_events_applied.fetch_add(1, Ordering::Relaxed);
        self.publish_change(account_id, client_id, PositionEventType::Intraday)
            .await?;
        Ok(())
    }

    // =========================================================================
    // DEADLINE / EVENTS / CONSUMERS
    // =========================================================================

    /// Past the configured EOD deadline, surface accounts still not
    /// COMPLETED. Processing continues regardless.
    pub fn check_deadline(&self) -> Result<Vec<i64>> {
        let today = self.clock.today();
        let deadline_ms = today
            .and_time(self.cfg.eod_deadline)
            .and_utc()
            .timestamp_millis();
        if self.clock.now_millis() < deadline_ms {
            return Ok(Vec::new());
        }
        let mut missed = self.eod.incomplete_accounts(today)?;
        missed.retain(|a| self.cfg.owns_account(*a));
        if !missed.is_empty() {
            self.stats.deadline_missed.store(true, Ordering::Relaxed);
            metrics::gauge!("eod_deadline_missed_accounts", missed.len() as f64);
            warn!(count = missed.len(), accounts = ?missed, "EOD deadline missed");
        }
        Ok(missed)
    }

    async fn publish_change(
        &self,
        account_id: i64,
        client_id: i64,
        event_type: PositionEventType,
    ) -> Result<()> {
        let event = PositionChangeEvent {
            account_id,
            client_id,
            event_type,
            ts: self.clock.now_millis(),
        };
        if self.cfg.notification_mode.includes_direct() {
            if let Some(tx) = self.direct_tx.lock().as_ref() {
                // best-effort; the fabric is the fallback
                let _ = tx.send(event.clone());
            }
        }
        if self.cfg.notification_mode.includes_fabric() {
            let broker = self.broker.clone();
            let key = account_id.to_string();
            self.guards
                .messaging
                .call(move || {
                    let broker = broker.clone();
                    let key = key.clone();
                    let event = event.clone();
                    async move {
                        broker
                            .publish(topics::POSITION_CHANGE_EVENTS, &key, &event)
                            .await
                    }
                })
                .await?;
        }
        Ok(())
    }

    /// Spawn the loader's partition consumers: EOD triggers, intraday
    /// snapshots and synthetic trade events. Non-owned accounts are
    /// silently ignored.
    pub fn spawn_consumers(
        self: &Arc<Self>,
        shutdown: ShutdownSignal,
    ) -> Vec<JoinHandle<()>> {
        let retry = RetryPolicy::from_policy(&self.cfg.dependencies.messaging);
        let mut handles = Vec::new();

        let loader = self.clone();
        handles.extend(crate::fabric::spawn_consumers(
            self.broker.clone(),
            topics::MSPM_EOD_TRIGGER,
            retry,
            shutdown.clone(),
            move |envelope: Envelope| {
                let loader = loader.clone();
                async move {
                    let trigger: EodTrigger = envelope.decode()?;
                    if !loader.cfg.owns_account(trigger.account_id) {
                        loader.stats.shard_skipped.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    let date = trigger
                        .business_date
                        .unwrap_or_else(|| loader.clock.today());
                    loader.run_eod(trigger.account_id, date).await.map(|_| ())
                }
            },
        ));

        let loader = self.clone();
        handles.extend(crate::fabric::spawn_consumers(
            self.broker.clone(),
            topics::MSPA_INTRADAY,
            retry,
            shutdown.clone(),
            move |envelope: Envelope| {
                let loader = loader.clone();
                async move {
                    let snapshot: AccountSnapshot = envelope.decode()?;
                    if !loader.cfg.owns_account(snapshot.account_id) {
                        loader.stats.shard_skipped.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    loader.apply_intraday(&snapshot).await.map(|_| ())
                }
            },
        ));

        let loader = self.clone();
        handles.extend(crate::fabric::spawn_consumers(
            self.broker.clone(),
            topics::INTRADAY_TRADE_EVENTS,
            retry,
            shutdown,
            move |envelope: Envelope| {
                let loader = loader.clone();
                async move {
                    let event: IntradayTradeEvent = envelope.decode()?;
                    if !loader.cfg.owns_account(event.account_id) {
                        loader.stats.shard_skipped.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    loader.apply_trade_event(&event).await
                }
            },
        ));

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TieredCache;
    use crate::clock::{Clock, ManualClock};
    use crate::fabric::register_platform_topics;
    use crate::kv::InMemoryKv;
    use crate::models::AssetClass;
    use crate::store::Database;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct StubFeed {
        snapshot: Mutex<Option<AccountSnapshot>>,
        fail: AtomicBool,
    }

    #[async_trait::async_trait]
    impl PositionFeed for StubFeed {
        async fn fetch_snapshot(
            &self,
            account_id: i64,
            _business_date: NaiveDate,
        ) -> Result<AccountSnapshot> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PlatformError::UpstreamUnavailable("connection reset".into()));
            }
            self.snapshot
                .lock()
                .clone()
                .ok_or_else(|| PlatformError::UpstreamUnavailable(format!("no data for {account_id}")))
        }
    }

    struct Harness {
        loader: Arc<PositionLoader>,
        feed: Arc<StubFeed>,
        clock: Arc<ManualClock>,
        broker: Arc<Broker>,
        positions: Arc<PositionStore>,
        eod: Arc<EodStore>,
        change_rx: Vec<mpsc::Receiver<Envelope>>,
    }

    fn snapshot_row(product_id: i64, ticker: &str, qty: Decimal, px: Decimal) -> SnapshotPosition {
        SnapshotPosition {
            product_id,
            ticker: ticker.into(),
            asset_class: AssetClass::Equity,
            issue_currency: "USD".into(),
            quantity: qty,
            txn_type: "PHYSICAL".into(),
            price: px,
            external_ref_id: None,
        }
    }

    fn snapshot(account_id: i64, positions: Vec<SnapshotPosition>) -> AccountSnapshot {
        AccountSnapshot {
            account_id,
            client_id: 55,
            client_name: "Meridian AM".into(),
            fund_id: 10,
            fund_name: "Global Macro".into(),
            base_currency: "USD".into(),
            account_number: format!("ACC-{account_id}"),
            account_type: "CUSTODY".into(),
            positions,
        }
    }

    fn harness() -> Harness {
        let mut cfg = Config::default();
        // keep test retries fast
        cfg.dependencies.upstream_feed.retry_base_wait = Duration::from_millis(1);
        cfg.dependencies.database.retry_base_wait = Duration::from_millis(1);
        cfg.dependencies.messaging.retry_base_wait = Duration::from_millis(1);
        let cfg = Arc::new(cfg);
        let clock = Arc::new(ManualClock::new(1_705_320_000_000)); // 2024-01-15
        let db = Database::open_in_memory().unwrap();
        let kv = Arc::new(InMemoryKv::new(clock.clone()));
        let broker = Arc::new(Broker::new());
        register_platform_topics(&broker);
        let change_rx = broker.take_receivers(topics::POSITION_CHANGE_EVENTS).unwrap();

        let positions = Arc::new(PositionStore::new(db.clone(), clock.clone()));
        let eod = Arc::new(EodStore::new(db.clone()));
        let refdata = Arc::new(RefDataStore::new(db.clone()));
        let audit = Arc::new(AuditStore::new(db.clone()));
        let cache = Arc::new(TieredCache::new(cfg.clone(), clock.clone(), kv.clone()));
        let fx = Arc::new(FxConverter::new(cache, cfg.pivot_currency.clone()));
        let feed = Arc::new(StubFeed {
            snapshot: Mutex::new(None),
            fail: AtomicBool::new(false),
        });
        let intraday_refs = Arc::new(IdempotencyStore::new(
            kv,
            "intraday",
            Duration::from_secs(3600),
        ));
        let guards = Arc::new(DependencyGuards::from_config(&cfg, clock.clone()));

        let loader = Arc::new(PositionLoader::new(
            cfg,
            clock.clone(),
            broker.clone(),
            positions.clone(),
            eod.clone(),
            refdata,
            audit,
            feed.clone(),
            fx,
            intraday_refs,
            guards,
        ));
        Harness {
            loader,
            feed,
            clock,
            broker,
            positions,
            eod,
            change_rx,
        }
    }

    fn drain_events(harness: &mut Harness) -> Vec<PositionChangeEvent> {
        let mut events = Vec::new();
        for rx in harness.change_rx.iter_mut() {
            while let Ok(envelope) = rx.try_recv() {
                events.push(envelope.decode::<PositionChangeEvent>().unwrap());
            }
        }
        events
    }

    fn business_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    #[tokio::test]
    async fn test_eod_happy_path() {
        let mut harness = harness();
        *harness.feed.snapshot.lock() = Some(snapshot(
            1001,
            vec![
                snapshot_row(1, "AAPL", dec!(100), dec!(150)),
                snapshot_row(2, "GOOGL", dec!(50), dec!(2800)),
                snapshot_row(3, "MSFT", dec!(200), dec!(300)),
            ],
        ));

        let outcome = harness.loader.run_eod(1001, business_date()).await.unwrap();
        assert_eq!(
            outcome,
            EodOutcome::Completed {
                batch_id: 1,
                position_count: 3
            }
        );

        let status = harness.eod.get_status(1001, business_date()).unwrap().unwrap();
        assert_eq!(status.status, EodStatus::Completed);
        assert_eq!(status.position_count, Some(3));

        let rows = harness
            .positions
            .get_positions_as_of(1001, business_date())
            .unwrap();
        assert_eq!(rows.len(), 3);

        let events = drain_events(&mut harness);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].account_id, 1001);
        assert_eq!(events[0].event_type, PositionEventType::EodComplete);
    }

    #[tokio::test]
    async fn test_eod_rerun_observes_completed() {
        let mut harness = harness();
        *harness.feed.snapshot.lock() =
            Some(snapshot(1001, vec![snapshot_row(1, "AAPL", dec!(100), dec!(150))]));

        harness.loader.run_eod(1001, business_date()).await.unwrap();
        let again = harness.loader.run_eod(1001, business_date()).await.unwrap();
        assert_eq!(again, EodOutcome::AlreadyCompleted);

        // No second batch, no second event
        assert_eq!(harness.positions.get_active_batch_id(1001).unwrap(), Some(1));
        assert_eq!(drain_events(&mut harness).len(), 1);
    }

    #[tokio::test]
    async fn test_eod_failure_leaves_active_batch_and_marks_failed() {
        let mut harness = harness();
        *harness.feed.snapshot.lock() =
            Some(snapshot(1001, vec![snapshot_row(1, "AAPL", dec!(100), dec!(150))]));
        harness.loader.run_eod(1001, business_date()).await.unwrap();
        drain_events(&mut harness);

        let next_day = NaiveDate::from_ymd_opt(2024, 1, 16).unwrap();
        harness.feed.fail.store(true, Ordering::SeqCst);
        let err = harness.loader.run_eod(1001, next_day).await.unwrap_err();
        assert!(err.retryable());

        // Old batch untouched, status FAILED, EOD-failed event out
        assert_eq!(harness.positions.get_active_batch_id(1001).unwrap(), Some(1));
        let status = harness.eod.get_status(1001, next_day).unwrap().unwrap();
        assert_eq!(status.status, EodStatus::Failed);
        assert!(status.error_text.is_some());
        let events = drain_events(&mut harness);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, PositionEventType::EodFailed);

        // Retry succeeds: FAILED -> IN_PROGRESS -> COMPLETED
        harness.feed.fail.store(false, Ordering::SeqCst);
        let outcome = harness.loader.run_eod(1001, next_day).await.unwrap();
        assert!(matches!(outcome, EodOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_empty_snapshot_completes_with_zero_positions() {
        let harness = harness();
        *harness.feed.snapshot.lock() = Some(snapshot(1001, vec![]));
        let outcome = harness.loader.run_eod(1001, business_date()).await.unwrap();
        assert_eq!(
            outcome,
            EodOutcome::Completed {
                batch_id: 1,
                position_count: 0
            }
        );
        let status = harness.eod.get_status(1001, business_date()).unwrap().unwrap();
        assert_eq!(status.status, EodStatus::Completed);
        assert!(harness
            .positions
            .get_positions_as_of(1001, business_date())
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_intraday_duplicate_ref_applied_once() {
        let mut harness = harness();
        *harness.feed.snapshot.lock() =
            Some(snapshot(1001, vec![snapshot_row(1, "AAPL", dec!(100), dec!(150))]));
        harness.loader.run_eod(1001, business_date()).await.unwrap();
        drain_events(&mut harness);

        let mut row = snapshot_row(1, "AAPL", dec!(10), dec!(151));
        row.external_ref_id = Some("REF-X".into());
        let intraday = snapshot(1001, vec![row]);

        assert_eq!(harness.loader.apply_intraday(&intraday).await.unwrap(), 1);
        // Same externalRefId again: dropped, no event
        assert_eq!(harness.loader.apply_intraday(&intraday).await.unwrap(), 0);
        assert_eq!(
            harness.loader.stats().intraday_duplicates.load(Ordering::Relaxed),
            1
        );

        let qty = harness
            .positions
            .get_quantity_as_of(1001, 1, harness.clock.now_millis())
            .unwrap();
        assert_eq!(qty, Some(dec!(10)));
        assert_eq!(drain_events(&mut harness).len(), 1);
    }

    #[tokio::test]
    async fn test_shard_filter_rejects_unowned_account() {
        let harness = harness();
        let mut cfg = Config::default();
        cfg.total_shards = 3;
        cfg.shard_index = 1;
        // Rebuild a loader with the sharded config reusing the harness stores
        let sharded = Arc::new(PositionLoader::new(
            Arc::new(cfg),
            harness.clock.clone(),
            harness.broker.clone(),
            harness.positions.clone(),
            harness.eod.clone(),
            Arc::new(RefDataStore::new(Database::open_in_memory().unwrap())),
            Arc::new(AuditStore::new(Database::open_in_memory().unwrap())),
            harness.feed.clone(),
            Arc::new(FxConverter::new(
                Arc::new(TieredCache::new(
                    Arc::new(Config::default()),
                    harness.clock.clone(),
                    Arc::new(InMemoryKv::new(harness.clock.clone())),
                )),
                "USD".into(),
            )),
            Arc::new(IdempotencyStore::new(
                Arc::new(InMemoryKv::new(harness.clock.clone())),
                "intraday",
                Duration::from_secs(60),
            )),
            Arc::new(DependencyGuards::from_config(
                &Config::default(),
                harness.clock.clone(),
            )),
        ));
        // 1002 % 3 == 0, not owned by shard 1
        let err = sharded.run_eod(1002, business_date()).await.unwrap_err();
        assert_eq!(err.code(), "SHARD_MISMATCH-701");
    }

    #[tokio::test]
    async fn test_manual_upload_identical_snapshot_is_noop() {
        let mut harness = harness();
        let snap = snapshot(1001, vec![snapshot_row(1, "AAPL", dec!(100), dec!(150))]);
        *harness.feed.snapshot.lock() = Some(snap.clone());
        harness.loader.run_eod(1001, business_date()).await.unwrap();
        drain_events(&mut harness);

        let outcome = harness
            .loader
            .manual_upload(&snap, business_date(), "ops.jsmith")
            .await
            .unwrap();
        assert_eq!(outcome, EodOutcome::NoChange);
        assert_eq!(harness.positions.get_active_batch_id(1001).unwrap(), Some(1));
        assert!(drain_events(&mut harness).is_empty());

        // A different snapshot does publish a new batch
        let changed = snapshot(1001, vec![snapshot_row(1, "AAPL", dec!(120), dec!(150))]);
        let outcome = harness
            .loader
            .manual_upload(&changed, business_date(), "ops.jsmith")
            .await
            .unwrap();
        assert!(matches!(outcome, EodOutcome::Completed { .. }));
        let events = drain_events(&mut harness);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, PositionEventType::ManualUpload);
    }

    #[tokio::test]
    async fn test_trade_event_applies_signed_delta() {
        let mut harness = harness();
        *harness.feed.snapshot.lock() =
            Some(snapshot(1001, vec![snapshot_row(1, "AAPL", dec!(100), dec!(150))]));
        harness.loader.run_eod(1001, business_date()).await.unwrap();
        drain_events(&mut harness);

        harness.clock.advance(1_000);
        harness
            .loader
            .apply_trade_event(&IntradayTradeEvent {
                account_id: 1001,
                client_order_id: "ORD-7".into(),
                product_id: Some(1),
                ticker: "AAPL".into(),
                side: crate::models::Side::Sell,
                filled_qty: dec!(40),
                vwap: dec!(151.25),
                ts: harness.clock.now_millis(),
            })
            .await
            .unwrap();

        let qty = harness
            .positions
            .get_quantity_as_of(1001, 1, harness.clock.now_millis())
            .unwrap();
        assert_eq!(qty, Some(dec!(60)));
        let events = drain_events(&mut harness);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, PositionEventType::Intraday);
    }

    #[tokio::test]
    async fn test_deadline_check_surfaces_incomplete_accounts() {
        let harness = harness();
        *harness.feed.snapshot.lock() =
            Some(snapshot(1001, vec![snapshot_row(1, "AAPL", dec!(100), dec!(150))]));
        harness.loader.run_eod(1001, business_date()).await.unwrap();
        // A second known account that never completes
        harness
            .loader
            .refdata
            .upsert_account(&snapshot(1002, vec![]).account_info())
            .unwrap();

        // Clock starts at 12:00 UTC; the default deadline is 18:00
        assert!(harness.loader.check_deadline().unwrap().is_empty());
        harness.clock.advance(7 * 60 * 60 * 1_000);
        assert_eq!(harness.loader.check_deadline().unwrap(), vec![1002]);
        assert!(harness.loader.stats().snapshot().deadline_missed);
    }

    #[tokio::test]
    async fn test_snapshot_over_error_threshold_rejected() {
        let harness = harness();
        // 2 of 3 rows invalid: 66% > 10% default threshold
        *harness.feed.snapshot.lock() = Some(snapshot(
            1001,
            vec![
                snapshot_row(1, "AAPL", dec!(0), dec!(150)),
                snapshot_row(2, "GOOGL", dec!(50), dec!(0)),
                snapshot_row(3, "MSFT", dec!(200), dec!(300)),
            ],
        ));
        let err = harness.loader.run_eod(1001, business_date()).await.unwrap_err();
        assert_eq!(err.code(), "SNAPSHOT_REJECTED-204");
        let status = harness.eod.get_status(1001, business_date()).unwrap().unwrap();
        assert_eq!(status.status, EodStatus::Failed);
    }
}
