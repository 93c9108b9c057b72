//! Orphan Detection
//!
//! Scheduled scan over the short-term order states: anything non-terminal
//! that has not moved within the threshold is marked ORPHANED in the
//! durable summary, its short-term state is deleted, and a metric fires.
//! An orphaned order accepts no further fills unless manually reopened.

use crate::clock::SharedClock;
use crate::config::Config;
use crate::errors::Result;
use crate::kv::KvStore;
use crate::shutdown::ShutdownSignal;
use crate::store::{AuditStore, FillStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::service::OrderState;

pub struct OrphanScanner {
    cfg: Arc<Config>,
    clock: SharedClock,
    kv: Arc<dyn KvStore>,
    fills: Arc<FillStore>,
    audit: Arc<AuditStore>,
    orphaned_total: AtomicU64,
}

impl OrphanScanner {
    pub fn new(
        cfg: Arc<Config>,
        clock: SharedClock,
        kv: Arc<dyn KvStore>,
        fills: Arc<FillStore>,
        audit: Arc<AuditStore>,
    ) -> Self {
        Self {
            cfg,
            clock,
            kv,
            fills,
            audit,
            orphaned_total: AtomicU64::new(0),
        }
    }

    pub fn orphaned_total(&self) -> u64 {
        self.orphaned_total.load(Ordering::Relaxed)
    }

    /// One scan pass. Returns the number of orders orphaned.
    pub async fn scan(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let threshold_ms = self.cfg.orphan_threshold.as_millis() as i64;

        let entries = match self.kv.scan_prefix("order:").await {
            Ok(entries) => entries,
            Err(err) => {
                // never fail the scheduler on a cache outage
                warn!(error = %err, "orphan scan skipped, KV unavailable");
                return Ok(0);
            }
        };

        let mut orphaned = 0usize;
        for (key, raw) in entries {
            let state: OrderState = match serde_json::from_str(&raw) {
                Ok(state) => state,
                Err(err) => {
                    warn!(%key, error = %err, "unreadable order state skipped");
                    continue;
                }
            };
            if state.status.is_terminal() {
                continue;
            }
            if now.saturating_sub(state.updated_at) <= threshold_ms {
                continue;
            }

            if self.fills.mark_orphaned(&state.client_order_id, now)? {
                if let Err(err) = self.kv.delete(&key).await {
                    warn!(%key, error = %err, "orphan state delete failed, TTL will reap it");
                }
                self.orphaned_total.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("orphaned_orders_total", 1);
                self.audit.record(
                    "system",
                    "ORDER_ORPHANED",
                    Some(state.account_id),
                    &state.client_order_id,
                    now,
                )?;
                info!(
                    client_order_id = %state.client_order_id,
                    age_ms = now - state.updated_at,
                    "order orphaned"
                );
                orphaned += 1;
            }
        }
        Ok(orphaned)
    }

    /// Run the scan on its configured interval until shutdown.
    pub fn spawn(self: &Arc<Self>, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
        let scanner = self.clone();
        let interval = self.cfg.orphan_scan_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = scanner.scan().await {
                            warn!(error = %err, "orphan scan failed");
                        }
                    }
                }
            }
        })
    }
}
