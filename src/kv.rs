//! Distributed Key/Value Store Abstraction
//!
//! Short-lived shared state lives here: idempotency refs, order lifecycle
//! state, L2 cache entries. The store is explicitly allowed to vanish:
//! losing it must never corrupt a system of record, it only forces replays.
//!
//! `put_if_absent` is the single atomic conditional write the idempotency
//! contract depends on.

use crate::clock::{Millis, SharedClock};
use crate::errors::{PlatformError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write with per-key TTL. Overwrites an existing entry.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomic conditional write: true iff the key was absent (or expired)
    /// and this caller claimed it.
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// All live (key, value) pairs under a prefix. Used by scheduled scans.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Millis,
}

const SHARD_COUNT: usize = 16;

/// In-process implementation with sharded locks and lazy TTL expiry.
///
/// `set_available(false)` simulates an outage; every operation then returns
/// `KV_UNAVAILABLE-305` so callers exercise their degrade paths.
pub struct InMemoryKv {
    shards: Vec<Mutex<HashMap<String, Entry>>>,
    clock: SharedClock,
    available: AtomicBool,
}

impl InMemoryKv {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            clock,
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PlatformError::KvUnavailable("store offline".into()))
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Entry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    fn live(&self, entry: &Entry) -> bool {
        entry.expires_at > self.clock.now_millis()
    }

    /// Purge expired entries. Called periodically by the owning process.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut purged = 0;
        for shard in &self.shards {
            let mut map = shard.lock();
            let before = map.len();
            map.retain(|_, e| e.expires_at > now);
            purged += before - map.len();
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let shard = self.shard(key);
        let mut map = shard.lock();
        match map.get(key) {
            Some(entry) if self.live(entry) => Ok(Some(entry.value.clone())),
            Some(_) => {
                map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check_available()?;
        let expires_at = self.clock.now_millis() + ttl.as_millis() as Millis;
        self.shard(key).lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.shard(key).lock().remove(key);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let shard = self.shard(key);
        let mut map = shard.lock();
        if let Some(existing) = map.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl.as_millis() as Millis,
            },
        );
        Ok(true)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.check_available()?;
        let now = self.clock.now_millis();
        let mut out = Vec::new();
        for shard in &self.shards {
            let map = shard.lock();
            for (k, e) in map.iter() {
                if e.expires_at > now && k.starts_with(prefix) {
                    out.push((k.clone(), e.value.clone()));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn kv_with_clock() -> (InMemoryKv, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        (InMemoryKv::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (kv, _) = kv_with_clock();
        kv.put("a", "1", Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some("1".to_string()));
        assert_eq!(kv.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let (kv, clock) = kv_with_clock();
        kv.put("a", "1", Duration::from_secs(60)).await.unwrap();
        clock.advance(59_999);
        assert!(kv.get("a").await.unwrap().is_some());
        clock.advance(1);
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_if_absent_claims_once() {
        let (kv, clock) = kv_with_clock();
        assert!(kv.put_if_absent("ref", "x", Duration::from_secs(60)).await.unwrap());
        assert!(!kv.put_if_absent("ref", "y", Duration::from_secs(60)).await.unwrap());
        // Expired claims are reclaimable
        clock.advance(60_001);
        assert!(kv.put_if_absent("ref", "z", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_prefix_skips_expired() {
        let (kv, clock) = kv_with_clock();
        kv.put("order:1", "a", Duration::from_secs(10)).await.unwrap();
        kv.put("order:2", "b", Duration::from_secs(100)).await.unwrap();
        kv.put("other:3", "c", Duration::from_secs(100)).await.unwrap();
        clock.advance(11_000);
        let mut found = kv.scan_prefix("order:").await.unwrap();
        found.sort();
        assert_eq!(found, vec![("order:2".to_string(), "b".to_string())]);
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let (kv, _) = kv_with_clock();
        kv.set_available(false);
        let err = kv.get("a").await.unwrap_err();
        assert_eq!(err.code(), "KV_UNAVAILABLE-305");
        kv.set_available(true);
        assert!(kv.get("a").await.is_ok());
    }

    #[tokio::test]
    async fn test_sweep_purges_expired() {
        let (kv, clock) = kv_with_clock();
        kv.put("a", "1", Duration::from_secs(1)).await.unwrap();
        kv.put("b", "2", Duration::from_secs(100)).await.unwrap();
        clock.advance(2_000);
        assert_eq!(kv.sweep(), 1);
        assert_eq!(kv.len(), 1);
    }
}
