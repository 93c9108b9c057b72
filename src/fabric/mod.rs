//! Messaging Fabric
//!
//! In-process realisation of the at-least-once topic contracts that glue the
//! services together: per-key ordering via key-hashed partitions, manual
//! acknowledgement, bounded retry, and `<topic>.DLQ` shadows for poisoned
//! payloads. The producer is idempotent within a session by construction.

pub mod broker;
pub mod consumer;
pub mod topics;

pub use broker::{Broker, DeadLetter, Envelope, DEFAULT_CAPACITY, DEFAULT_PARTITIONS};
pub use consumer::{run_partition, spawn_consumers};

use std::sync::Arc;

/// Register the platform's full topic set.
pub fn register_platform_topics(broker: &Arc<Broker>) {
    for topic in [
        topics::MSPM_EOD_TRIGGER,
        topics::MSPA_INTRADAY,
        topics::MARKET_DATA_TICKS,
        topics::FX_RATES_TICKS,
        topics::POSITION_CHANGE_EVENTS,
        topics::CLIENT_REPORTING_SIGNOFF,
        topics::FX_MATRIX_ORDERS,
        topics::RAW_EXECUTION_REPORTS,
        topics::INTRADAY_TRADE_EVENTS,
    ] {
        broker.register_topic(topic, DEFAULT_PARTITIONS, DEFAULT_CAPACITY);
    }
}
