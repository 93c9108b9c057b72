//! Trade Aggregator Service
//!
//! Execution-report ingestion with per-order accumulation, VWAP on
//! completion, synthetic intraday trade events, and orphan detection.

pub mod orphan;
pub mod service;

pub use orphan::OrphanScanner;
pub use service::{AggregatorStats, OrderState, TradeAggregator};
