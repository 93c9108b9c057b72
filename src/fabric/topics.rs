//! Topic Contracts
//!
//! Topic names and their partition keys. Partitioning is by natural entity
//! key (accountId for position events, client order id for fills,
//! productId for market data), which is what guarantees per-key ordering.

pub const MSPM_EOD_TRIGGER: &str = "MSPM_EOD_TRIGGER";
pub const MSPA_INTRADAY: &str = "MSPA_INTRADAY";
pub const MARKET_DATA_TICKS: &str = "MARKET_DATA_TICKS";
pub const FX_RATES_TICKS: &str = "FX_RATES_TICKS";
pub const POSITION_CHANGE_EVENTS: &str = "POSITION_CHANGE_EVENTS";
pub const CLIENT_REPORTING_SIGNOFF: &str = "CLIENT_REPORTING_SIGNOFF";
pub const FX_MATRIX_ORDERS: &str = "FX_MATRIX_ORDERS";
pub const RAW_EXECUTION_REPORTS: &str = "RAW_EXECUTION_REPORTS";
pub const INTRADAY_TRADE_EVENTS: &str = "INTRADAY_TRADE_EVENTS";

pub fn dlq_topic(topic: &str) -> String {
    format!("{topic}.DLQ")
}
