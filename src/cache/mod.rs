//! Caching Layer
//!
//! - `idempotency`: short-TTL processed-reference set over the KV store
//! - `price_cache`: two-tier source-ranked price/FX cache
//! - `reverse_index`: product -> holding accounts fan-out index
//! - `symbology`: ticker -> product id resolver

pub mod idempotency;
pub mod price_cache;
pub mod reverse_index;
pub mod symbology;

pub use idempotency::IdempotencyStore;
pub use price_cache::{CacheEntry, PriceBackstop, PriceLookup, PutOutcome, TieredCache};
pub use reverse_index::ReverseIndex;
pub use symbology::SymbologyResolver;
