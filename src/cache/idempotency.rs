//! Idempotency Store
//!
//! Short-TTL set of processed external references over the distributed KV
//! store. `check_and_mark` is the one atomic claim operation; everything
//! else is sugar over it.
//!
//! Degrade contract: when the KV store is unavailable the answer is always
//! "not a duplicate"; ingestion must never block on cache availability.
//! Degrades are counted.

use crate::kv::KvStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Default)]
pub struct IdempotencyStats {
    pub duplicates_dropped: AtomicU64,
    pub degraded_checks: AtomicU64,
}

pub struct IdempotencyStore {
    kv: Arc<dyn KvStore>,
    prefix: &'static str,
    ttl: Duration,
    stats: IdempotencyStats,
}

fn is_blank(r: &str) -> bool {
    r.trim().is_empty()
}

impl IdempotencyStore {
    /// `prefix` namespaces the refs of one ingestion path (fills vs intraday
    /// records carry different TTLs).
    pub fn new(kv: Arc<dyn KvStore>, prefix: &'static str, ttl: Duration) -> Self {
        Self {
            kv,
            prefix,
            ttl,
            stats: IdempotencyStats::default(),
        }
    }

    fn key(&self, r: &str) -> String {
        format!("{}:{}", self.prefix, r)
    }

    /// True iff the ref has already been processed. Blank refs are never
    /// duplicates; the caller owns ref generation.
    pub async fn is_duplicate(&self, r: &str) -> bool {
        if is_blank(r) {
            return false;
        }
        match self.kv.get(&self.key(r)).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                self.degrade("is_duplicate", &e);
                false
            }
        }
    }

    pub async fn mark_processed(&self, r: &str) {
        if is_blank(r) {
            return;
        }
        if let Err(e) = self.kv.put(&self.key(r), "1", self.ttl).await {
            self.degrade("mark_processed", &e);
        }
    }

    /// Atomic claim: true iff this caller is the first to claim the ref
    /// within TTL. Blank refs are always claimable.
    pub async fn check_and_mark(&self, r: &str) -> bool {
        if is_blank(r) {
            return true;
        }
        match self.kv.put_if_absent(&self.key(r), "1", self.ttl).await {
            Ok(true) => true,
            Ok(false) => {
                self.stats.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("idempotency_duplicates_dropped_total", 1);
                false
            }
            Err(e) => {
                self.degrade("check_and_mark", &e);
                true
            }
        }
    }

    /// Keep only refs not yet processed. Blank refs pass through.
    pub async fn filter_duplicates(&self, refs: &[String]) -> Vec<String> {
        let mut fresh = Vec::with_capacity(refs.len());
        for r in refs {
            if !self.is_duplicate(r).await {
                fresh.push(r.clone());
            }
        }
        fresh
    }

    pub async fn mark_processed_batch(&self, refs: &[String]) {
        for r in refs {
            self.mark_processed(r).await;
        }
    }

    pub fn stats(&self) -> &IdempotencyStats {
        &self.stats
    }

    fn degrade(&self, op: &str, err: &crate::errors::PlatformError) {
        self.stats.degraded_checks.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("idempotency_degraded_total", 1);
        warn!(op, error = %err, "idempotency store degraded to not-duplicate");
    }
}
