//! Domain Model
//!
//! Core entities and topic payloads shared across the loader, price service,
//! trade aggregator and analytics. Wire payloads serialize with
//! SCREAMING_SNAKE enum tags to match the upstream feed conventions.
//!
//! Numeric conventions: quantities 4 dp, prices 6 dp, FX rates 8 dp, VWAP
//! 8 dp rounded half-up. All money math is `rust_decimal::Decimal`.

use crate::clock::Millis;
use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

// =============================================================================
// NUMERIC SCALES
// =============================================================================

pub const QTY_DP: u32 = 4;
pub const PRICE_DP: u32 = 6;
pub const FX_DP: u32 = 8;
pub const VWAP_DP: u32 = 8;

pub fn round_qty(v: Decimal) -> Decimal {
    v.round_dp(QTY_DP)
}

pub fn round_price(v: Decimal) -> Decimal {
    v.round_dp(PRICE_DP)
}

pub fn round_fx(v: Decimal) -> Decimal {
    v.round_dp(FX_DP)
}

/// VWAP contract: half-up to 8 dp.
pub fn round_vwap(v: Decimal) -> Decimal {
    v.round_dp_with_strategy(VWAP_DP, RoundingStrategy::MidpointAwayFromZero)
}

// =============================================================================
// REFERENCE DATA
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetClass {
    Equity,
    Cash,
    FxSpot,
    FxForward,
    EquitySwap,
    Bond,
    Future,
}

impl AssetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Equity => "EQUITY",
            AssetClass::Cash => "CASH",
            AssetClass::FxSpot => "FX_SPOT",
            AssetClass::FxForward => "FX_FORWARD",
            AssetClass::EquitySwap => "EQUITY_SWAP",
            AssetClass::Bond => "BOND",
            AssetClass::Future => "FUTURE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EQUITY" => Some(AssetClass::Equity),
            "CASH" => Some(AssetClass::Cash),
            "FX_SPOT" => Some(AssetClass::FxSpot),
            "FX_FORWARD" => Some(AssetClass::FxForward),
            "EQUITY_SWAP" => Some(AssetClass::EquitySwap),
            "BOND" => Some(AssetClass::Bond),
            "FUTURE" => Some(AssetClass::Future),
            _ => None,
        }
    }
}

/// Tradable instrument. (identifier_type, identifier) is unique among active
/// products.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub product_id: i64,
    pub identifier_type: String,
    pub identifier: String,
    pub ticker: String,
    pub asset_class: AssetClass,
    pub issue_currency: String,
    pub settlement_currency: String,
    pub risk_region: Option<String>,
    pub active: bool,
}

/// Account with its fund/client lineage. Created out-of-band, effectively
/// immutable within the core; replicated here from snapshot headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_id: i64,
    pub account_number: String,
    pub account_type: String,
    pub fund_id: i64,
    pub fund_name: String,
    pub client_id: i64,
    pub client_name: String,
    pub base_currency: String,
}

// =============================================================================
// PRICES & FX
// =============================================================================

/// Price sources in priority order: OVERRIDE > REALTIME > RCP_SNAP > MSPA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceSource {
    Override,
    Realtime,
    RcpSnap,
    Mspa,
}

impl PriceSource {
    /// Higher rank wins on cache write.
    pub fn rank(&self) -> u8 {
        match self {
            PriceSource::Override => 4,
            PriceSource::Realtime => 3,
            PriceSource::RcpSnap => 2,
            PriceSource::Mspa => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSource::Override => "OVERRIDE",
            PriceSource::Realtime => "REALTIME",
            PriceSource::RcpSnap => "RCP_SNAP",
            PriceSource::Mspa => "MSPA",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OVERRIDE" => Some(PriceSource::Override),
            "REALTIME" => Some(PriceSource::Realtime),
            "RCP_SNAP" => Some(PriceSource::RcpSnap),
            "MSPA" => Some(PriceSource::Mspa),
            _ => None,
        }
    }
}

/// Market-data tick, keyed by product on the fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTick {
    pub product_id: Option<i64>,
    pub ticker: String,
    pub price: Decimal,
    pub currency: String,
    pub asset_class: AssetClass,
    pub ts: Millis,
    pub source: PriceSource,
}

/// FX-rate tick, keyed by currency pair ("EUR/USD") on the fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FxRateTick {
    pub pair: String,
    pub rate: Decimal,
    pub forward_points: Option<Decimal>,
    pub ts: Millis,
    pub source: PriceSource,
}

/// Split "EUR/USD" into ("EUR", "USD"). Returns None unless both legs are
/// 3-letter codes.
pub fn split_pair(pair: &str) -> Option<(&str, &str)> {
    let (base, quote) = pair.split_once('/')?;
    if base.len() == 3 && quote.len() == 3 {
        Some((base, quote))
    } else {
        None
    }
}

// =============================================================================
// POSITIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionType {
    Physical,
    Synthetic,
}

impl PositionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionType::Physical => "PHYSICAL",
            PositionType::Synthetic => "SYNTHETIC",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PHYSICAL" => Some(PositionType::Physical),
            "SYNTHETIC" => Some(PositionType::Synthetic),
            _ => None,
        }
    }
}

/// Bitemporal position row. Both time dimensions are half-open `[from, to)`;
/// a current row has `system_to == SYSTEM_TIME_OPEN`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub account_id: i64,
    pub product_id: i64,
    pub batch_id: i64,
    pub business_date: NaiveDate,
    pub quantity: Decimal,
    pub price_used: Decimal,
    pub fx_rate_used: Decimal,
    pub market_value_local: Decimal,
    pub market_value_base: Decimal,
    pub cost_basis_local: Decimal,
    pub cost_basis_base: Decimal,
    pub unrealized_pnl_local: Decimal,
    pub unrealized_pnl_base: Decimal,
    pub source_system: String,
    pub position_type: PositionType,
    pub excluded: bool,
    pub valid_from: NaiveDate,
    pub valid_to: NaiveDate,
    pub system_from: Millis,
    pub system_to: Millis,
}

// =============================================================================
// SNAPSHOT PAYLOADS (upstream feed + intraday)
// =============================================================================

/// One row of an upstream position snapshot. `external_ref_id` is the
/// per-row idempotency key for intraday records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPosition {
    pub product_id: i64,
    pub ticker: String,
    pub asset_class: AssetClass,
    pub issue_currency: String,
    pub quantity: Decimal,
    pub txn_type: String,
    pub price: Decimal,
    pub external_ref_id: Option<String>,
}

/// Full per-account snapshot as delivered by the upstream feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: i64,
    pub client_id: i64,
    pub client_name: String,
    pub fund_id: i64,
    pub fund_name: String,
    pub base_currency: String,
    pub account_number: String,
    pub account_type: String,
    pub positions: Vec<SnapshotPosition>,
}

impl AccountSnapshot {
    pub fn account_info(&self) -> AccountInfo {
        AccountInfo {
            account_id: self.account_id,
            account_number: self.account_number.clone(),
            account_type: self.account_type.clone(),
            fund_id: self.fund_id,
            fund_name: self.fund_name.clone(),
            client_id: self.client_id,
            client_name: self.client_name.clone(),
            base_currency: self.base_currency.clone(),
        }
    }
}

/// EOD trigger marker, keyed by account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EodTrigger {
    pub account_id: i64,
    pub business_date: Option<NaiveDate>,
}

// =============================================================================
// POSITION CHANGE EVENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionEventType {
    EodComplete,
    EodFailed,
    Intraday,
    ManualUpload,
    CacheInvalidate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionChangeEvent {
    pub account_id: i64,
    pub client_id: i64,
    pub event_type: PositionEventType,
    pub ts: Millis,
}

/// Published once per (client, business date) when every account of the
/// client has completed EOD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignoffEvent {
    pub client_id: i64,
    pub business_date: NaiveDate,
    pub account_count: usize,
    pub ts: Millis,
}

// =============================================================================
// ORDERS & FILLS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }

    /// Signed multiplier applied to fill quantity when it feeds back into
    /// positions.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PendingNew,
    Sent,
    Acknowledged,
    PartiallyFilled,
    Filled,
    Rejected,
    Canceled,
    Orphaned,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Rejected
                | OrderStatus::Canceled
                | OrderStatus::Orphaned
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PendingNew => "PENDING_NEW",
            OrderStatus::Sent => "SENT",
            OrderStatus::Acknowledged => "ACKNOWLEDGED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Orphaned => "ORPHANED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(OrderStatus::New),
            "PENDING_NEW" => Some(OrderStatus::PendingNew),
            "SENT" => Some(OrderStatus::Sent),
            "ACKNOWLEDGED" => Some(OrderStatus::Acknowledged),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "CANCELED" => Some(OrderStatus::Canceled),
            "ORPHANED" => Some(OrderStatus::Orphaned),
            _ => None,
        }
    }
}

/// Execution report from the trade channel, keyed by client order id.
/// `exec_id` is globally unique and is the idempotency key for fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub exec_id: String,
    pub client_order_id: String,
    pub external_order_id: Option<String>,
    pub account_id: i64,
    pub ticker: String,
    pub asset_class: AssetClass,
    pub side: Side,
    pub last_qty: Decimal,
    pub last_px: Decimal,
    pub cum_qty: Decimal,
    pub status: OrderStatus,
    /// Maturity date for forward fills; absent for spot.
    pub maturity_date: Option<NaiveDate>,
    pub ts: Millis,
}

/// Synthetic intraday trade event published when an order completes,
/// keyed by account and consumed by the Position Loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntradayTradeEvent {
    pub account_id: i64,
    pub client_order_id: String,
    pub product_id: Option<i64>,
    pub ticker: String,
    pub side: Side,
    pub filled_qty: Decimal,
    pub vwap: Decimal,
    pub ts: Millis,
}

/// Forward contract derived from an executed forward fill. Drives the
/// maturity ladder and maturity alerts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardContract {
    pub client_order_id: String,
    pub account_id: i64,
    pub currency_pair: String,
    pub notional: Decimal,
    pub forward_rate: Decimal,
    pub maturity_date: NaiveDate,
    pub created_at: Millis,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_source_rank_ordering() {
        assert!(PriceSource::Override.rank() > PriceSource::Realtime.rank());
        assert!(PriceSource::Realtime.rank() > PriceSource::RcpSnap.rank());
        assert!(PriceSource::RcpSnap.rank() > PriceSource::Mspa.rank());
    }

    #[test]
    fn test_vwap_rounds_half_up() {
        assert_eq!(round_vwap(dec!(1.054050000049)), dec!(1.05405000));
        assert_eq!(round_vwap(dec!(0.000000005)), dec!(0.00000001));
        assert_eq!(round_vwap(dec!(-0.000000005)), dec!(-0.00000001));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Orphaned.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
        assert!(!OrderStatus::Acknowledged.is_terminal());
    }

    #[test]
    fn test_split_pair() {
        assert_eq!(split_pair("EUR/USD"), Some(("EUR", "USD")));
        assert_eq!(split_pair("EURUSD"), None);
        assert_eq!(split_pair("E/USD"), None);
    }

    #[test]
    fn test_enum_wire_format_is_screaming_snake() {
        let json = serde_json::to_string(&PositionEventType::EodComplete).unwrap();
        assert_eq!(json, "\"EOD_COMPLETE\"");
        let json = serde_json::to_string(&AssetClass::FxForward).unwrap();
        assert_eq!(json, "\"FX_FORWARD\"");
        let status: OrderStatus = serde_json::from_str("\"PARTIALLY_FILLED\"").unwrap();
        assert_eq!(status, OrderStatus::PartiallyFilled);
    }
}
