//! Price Service
//!
//! Tick ingestion into the two-tier cache, throttled database flush,
//! reverse-index fan-out into conflated per-account revaluations, and FX
//! conversion with pivot triangulation.

pub mod fx;
pub mod revaluation;
pub mod service;

pub use fx::{FxConverter, FxRateUsed};
pub use revaluation::{ConflationBuffer, RevaluationUpdate, SubscriptionHub};
pub use service::{PriceService, PricingStats};
