//! Two-Tier Price & FX Cache
//!
//! L1 is an in-process bounded map with a write-TTL; L2 is the distributed
//! KV store with a longer TTL; the backstop is the price table. Read path
//! L1 -> L2 (promote on hit) -> backstop. Writes update both tiers.
//!
//! Source priority is enforced on write: a write is accepted only when its
//! source rank is >= the rank of the cached entry, or the cached entry has
//! passed its per-source staleness deadline. Zero prices are never cached.
//!
//! L2 failures are swallowed and counted; the cache keeps serving from L1.

use crate::clock::{Millis, SharedClock};
use crate::config::Config;
use crate::errors::Result;
use crate::kv::KvStore;
use crate::models::PriceSource;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A cached price or FX value with its provenance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Decimal,
    pub source: PriceSource,
    /// Observation time of the underlying tick.
    pub ts: Millis,
}

/// Read result; `stale` means the value outlived its per-source deadline and
/// no fresher value existed in any tier. Valuation surfaces a warning.
#[derive(Debug, Clone, Copy)]
pub struct PriceLookup {
    pub entry: CacheEntry,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Accepted,
    RejectedZero,
    RejectedRank,
}

/// Last-resort read path, implemented by the price table.
pub trait PriceBackstop: Send + Sync {
    fn load_price(&self, product_id: i64) -> Result<Option<CacheEntry>>;
    fn load_fx(&self, pair: &str) -> Result<Option<CacheEntry>>;
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub l1_hits: AtomicU64,
    pub l2_hits: AtomicU64,
    pub backstop_hits: AtomicU64,
    pub misses: AtomicU64,
    pub zero_rejected: AtomicU64,
    pub rank_rejected: AtomicU64,
    pub l2_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct L1Slot {
    entry: CacheEntry,
    written_at: Millis,
}

pub struct TieredCache {
    cfg: Arc<Config>,
    clock: SharedClock,
    kv: Arc<dyn KvStore>,
    backstop: RwLock<Option<Arc<dyn PriceBackstop>>>,
    l1_prices: RwLock<HashMap<i64, L1Slot>>,
    l1_fx: RwLock<HashMap<String, L1Slot>>,
    stats: CacheStats,
}

impl TieredCache {
    pub fn new(cfg: Arc<Config>, clock: SharedClock, kv: Arc<dyn KvStore>) -> Self {
        Self {
            cfg,
            clock,
            kv,
            backstop: RwLock::new(None),
            l1_prices: RwLock::new(HashMap::new()),
            l1_fx: RwLock::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    pub fn set_backstop(&self, backstop: Arc<dyn PriceBackstop>) {
        *self.backstop.write() = Some(backstop);
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn is_stale(&self, entry: &CacheEntry) -> bool {
        let age = self.clock.now_millis().saturating_sub(entry.ts);
        age > self.cfg.max_age(entry.source).as_millis() as i64
    }

    // --- prices ---

    pub async fn get_price(&self, product_id: i64) -> Option<PriceLookup> {
        self.get(
            &self.l1_prices,
            &product_id,
            &price_l2_key(product_id),
            self.cfg.price_l1_ttl.as_millis() as i64,
            |b| b.load_price(product_id),
        )
        .await
    }

    pub async fn put_price(&self, product_id: i64, entry: CacheEntry) -> PutOutcome {
        self.put(
            &self.l1_prices,
            product_id,
            price_l2_key(product_id),
            entry,
            self.cfg.price_l1_cap,
            self.cfg.price_l1_ttl.as_millis() as i64,
        )
        .await
    }

    pub async fn evict_price(&self, product_id: i64) {
        self.l1_prices.write().remove(&product_id);
        if let Err(e) = self.kv.delete(&price_l2_key(product_id)).await {
            self.l2_error("evict_price", &e);
        }
    }

    // --- fx ---

    pub async fn get_fx(&self, pair: &str) -> Option<PriceLookup> {
        self.get(
            &self.l1_fx,
            &pair.to_string(),
            &fx_l2_key(pair),
            self.cfg.fx_l1_ttl.as_millis() as i64,
            |b| b.load_fx(pair),
        )
        .await
    }

    pub async fn put_fx(&self, pair: &str, entry: CacheEntry) -> PutOutcome {
        self.put(
            &self.l1_fx,
            pair.to_string(),
            fx_l2_key(pair),
            entry,
            self.cfg.fx_l1_cap,
            self.cfg.fx_l1_ttl.as_millis() as i64,
        )
        .await
    }

    pub async fn evict_fx(&self, pair: &str) {
        self.l1_fx.write().remove(pair);
        if let Err(e) = self.kv.delete(&fx_l2_key(pair)).await {
            self.l2_error("evict_fx", &e);
        }
    }

    // --- shared paths ---

    async fn get<K, F>(
        &self,
        l1: &RwLock<HashMap<K, L1Slot>>,
        key: &K,
        l2_key: &str,
        l1_write_ttl_ms: i64,
        load: F,
    ) -> Option<PriceLookup>
    where
        K: std::hash::Hash + Eq + Clone,
        F: Fn(&dyn PriceBackstop) -> Result<Option<CacheEntry>>,
    {
        let now = self.clock.now_millis();
        let mut stale_candidate: Option<CacheEntry> = None;

        if let Some(slot) = l1.read().get(key).copied() {
            if now.saturating_sub(slot.written_at) <= l1_write_ttl_ms {
                if !self.is_stale(&slot.entry) {
                    self.stats.l1_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(PriceLookup {
                        entry: slot.entry,
                        stale: false,
                    });
                }
                stale_candidate = Some(slot.entry);
            }
        }

        match self.kv.get(l2_key).await {
            Ok(Some(raw)) => match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(entry) => {
                    if !self.is_stale(&entry) {
                        self.stats.l2_hits.fetch_add(1, Ordering::Relaxed);
                        self.promote(l1, key.clone(), entry, now);
                        return Some(PriceLookup {
                            entry,
                            stale: false,
                        });
                    }
                    if stale_candidate.map_or(true, |c| entry.ts > c.ts) {
                        stale_candidate = Some(entry);
                    }
                }
                Err(e) => self.l2_error("decode", &e.into()),
            },
            Ok(None) => {}
            Err(e) => self.l2_error("get", &e),
        }

        let backstop = self.backstop.read().clone();
        if let Some(backstop) = backstop {
            match load(backstop.as_ref()) {
                Ok(Some(entry)) => {
                    if !self.is_stale(&entry) {
                        self.stats.backstop_hits.fetch_add(1, Ordering::Relaxed);
                        self.promote(l1, key.clone(), entry, now);
                        return Some(PriceLookup {
                            entry,
                            stale: false,
                        });
                    }
                    if stale_candidate.map_or(true, |c| entry.ts > c.ts) {
                        stale_candidate = Some(entry);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "price backstop read failed"),
            }
        }

        match stale_candidate {
            Some(entry) => Some(PriceLookup { entry, stale: true }),
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn put<K>(
        &self,
        l1: &RwLock<HashMap<K, L1Slot>>,
        key: K,
        l2_key: String,
        entry: CacheEntry,
        cap: usize,
        _l1_write_ttl_ms: i64,
    ) -> PutOutcome
    where
        K: std::hash::Hash + Eq + Clone,
    {
        if entry.value.is_zero() {
            self.stats.zero_rejected.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("zero_price_detected_total", 1);
            debug!(source = entry.source.as_str(), "zero value rejected, not cached");
            return PutOutcome::RejectedZero;
        }

        // Rank rule against whichever tier currently holds the entry
        let cached_l1 = l1.read().get(&key).map(|slot| slot.entry);
        let current = match cached_l1 {
            Some(entry) => Some(entry),
            None => match self.kv.get(&l2_key).await {
                Ok(Some(raw)) => serde_json::from_str::<CacheEntry>(&raw).ok(),
                Ok(None) => None,
                Err(e) => {
                    self.l2_error("put_read", &e);
                    None
                }
            },
        };
        if let Some(current) = current {
            if entry.source.rank() < current.source.rank() && !self.is_stale(&current) {
                self.stats.rank_rejected.fetch_add(1, Ordering::Relaxed);
                return PutOutcome::RejectedRank;
            }
        }

        let now = self.clock.now_millis();
        {
            let mut map = l1.write();
            if map.len() >= cap && !map.contains_key(&key) {
                if let Some(oldest) = map
                    .iter()
                    .min_by_key(|(_, slot)| slot.written_at)
                    .map(|(k, _)| k.clone())
                {
                    map.remove(&oldest);
                }
            }
            map.insert(
                key,
                L1Slot {
                    entry,
                    written_at: now,
                },
            );
        }

        match serde_json::to_string(&entry) {
            Ok(raw) => {
                if let Err(e) = self.kv.put(&l2_key, &raw, self.cfg.l2_ttl).await {
                    self.l2_error("put", &e);
                }
            }
            Err(e) => self.l2_error("encode", &e.into()),
        }

        PutOutcome::Accepted
    }

    fn promote<K: std::hash::Hash + Eq>(
        &self,
        l1: &RwLock<HashMap<K, L1Slot>>,
        key: K,
        entry: CacheEntry,
        now: Millis,
    ) {
        l1.write().insert(
            key,
            L1Slot {
                entry,
                written_at: now,
            },
        );
    }

    fn l2_error(&self, op: &str, err: &crate::errors::PlatformError) {
        self.stats.l2_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("price_cache_l2_errors_total", 1);
        warn!(op, error = %err, "L2 cache error swallowed, serving from L1");
    }
}

fn price_l2_key(product_id: i64) -> String {
    format!("px:{product_id}")
}

fn fx_l2_key(pair: &str) -> String {
    format!("fx:{pair}")
}
