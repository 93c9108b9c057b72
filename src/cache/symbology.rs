//! Symbology Resolver
//!
//! Fully cached ticker -> internal product id map. The whole map is swapped
//! atomically on refresh so the tick-ingest hot path reads lock-free.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Default)]
pub struct SymbologyResolver {
    map: ArcSwap<HashMap<String, i64>>,
}

impl SymbologyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a ticker. Missing resolutions fall back to the raw
    /// identifier carried in the tick (the caller's concern).
    pub fn resolve_ticker(&self, ticker: &str) -> Option<i64> {
        self.map.load().get(ticker).copied()
    }

    /// Swap in a freshly loaded mapping (from the products table).
    pub fn reload<I: IntoIterator<Item = (String, i64)>>(&self, entries: I) {
        let map: HashMap<String, i64> = entries.into_iter().collect();
        info!(tickers = map.len(), "symbology reloaded");
        self.map.store(Arc::new(map));
    }

    pub fn len(&self) -> usize {
        self.map.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
