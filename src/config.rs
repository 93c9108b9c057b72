//! Runtime Configuration
//!
//! Environment-driven configuration with parsed defaults. Everything the
//! operator tunes lives here: sharding, EOD deadline, cache TTLs and caps,
//! per-source staleness deadlines, per-dependency resilience policies,
//! orphan thresholds and delivery mode.

use crate::models::PriceSource;
use chrono::NaiveTime;
use std::env;
use std::time::Duration;

fn env_str(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_millis(var: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(var, default_ms))
}

/// How cache-invalidation notifications reach the price service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationMode {
    /// Best-effort synchronous channel only.
    Direct,
    /// Messaging fabric only.
    Fabric,
    /// Both paths; recipients dedup.
    Both,
}

impl NotificationMode {
    fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "DIRECT" => NotificationMode::Direct,
            "FABRIC" => NotificationMode::Fabric,
            _ => NotificationMode::Both,
        }
    }

    pub fn includes_direct(&self) -> bool {
        matches!(self, NotificationMode::Direct | NotificationMode::Both)
    }

    pub fn includes_fabric(&self) -> bool {
        matches!(self, NotificationMode::Fabric | NotificationMode::Both)
    }
}

/// Resilience settings for one named cross-process dependency.
#[derive(Debug, Clone)]
pub struct DependencyPolicy {
    pub name: &'static str,
    pub call_timeout: Duration,
    pub failure_rate_threshold: f64,
    pub slow_call_threshold: Duration,
    pub slow_rate_threshold: f64,
    pub window_size: usize,
    pub min_calls: usize,
    pub open_wait: Duration,
    pub half_open_probes: u32,
    pub retry_max_attempts: u32,
    pub retry_base_wait: Duration,
    pub retry_exponential: bool,
    pub rate_permits: u64,
    pub rate_period: Duration,
}

impl DependencyPolicy {
    fn from_env(
        name: &'static str,
        prefix: &str,
        timeout_ms: u64,
        retry_max: u32,
        retry_base_ms: u64,
        retry_exponential: bool,
        rate_permits: u64,
    ) -> Self {
        Self {
            name,
            call_timeout: env_millis(&format!("{prefix}_TIMEOUT_MS"), timeout_ms),
            failure_rate_threshold: env_parse(&format!("{prefix}_FAILURE_RATE"), 0.5),
            slow_call_threshold: env_millis(&format!("{prefix}_SLOW_CALL_MS"), timeout_ms / 2),
            slow_rate_threshold: env_parse(&format!("{prefix}_SLOW_RATE"), 0.8),
            window_size: env_parse(&format!("{prefix}_WINDOW_SIZE"), 50),
            min_calls: env_parse(&format!("{prefix}_MIN_CALLS"), 10),
            open_wait: env_millis(&format!("{prefix}_OPEN_WAIT_MS"), 30_000),
            half_open_probes: env_parse(&format!("{prefix}_HALF_OPEN_PROBES"), 3),
            retry_max_attempts: env_parse(&format!("{prefix}_RETRY_MAX"), retry_max),
            retry_base_wait: env_millis(&format!("{prefix}_RETRY_WAIT_MS"), retry_base_ms),
            retry_exponential: env_parse(&format!("{prefix}_RETRY_EXPONENTIAL"), retry_exponential),
            rate_permits: env_parse(&format!("{prefix}_RATE_PERMITS"), rate_permits),
            rate_period: env_millis(&format!("{prefix}_RATE_PERIOD_MS"), 1_000),
        }
    }
}

/// Per-dependency resilience policies, tabulated.
#[derive(Debug, Clone)]
pub struct DependencyConfigs {
    pub database: DependencyPolicy,
    pub kv: DependencyPolicy,
    pub messaging: DependencyPolicy,
    pub upstream_feed: DependencyPolicy,
    pub trade_channel: DependencyPolicy,
}

impl DependencyConfigs {
    fn from_env() -> Self {
        Self {
            // Transient DB errors: exponential 0.5s base x 5
            database: DependencyPolicy::from_env("database", "HL_DB", 10_000, 5, 500, true, 5_000),
            kv: DependencyPolicy::from_env("kv", "HL_KV", 500, 2, 100, false, 50_000),
            // Fill ingestion path: fixed 1s x 3
            messaging: DependencyPolicy::from_env("messaging", "HL_MSG", 3_000, 3, 1_000, false, 20_000),
            upstream_feed: DependencyPolicy::from_env("upstream_feed", "HL_FEED", 15_000, 3, 2_000, true, 100),
            trade_channel: DependencyPolicy::from_env("trade_channel", "HL_TRADE", 5_000, 3, 1_000, false, 500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,

    // Sharding: an account is owned by shard |account_id| mod total_shards
    pub shard_index: u32,
    pub total_shards: u32,

    // EOD orchestration
    pub eod_deadline: NaiveTime,
    pub validation_error_threshold: f64,

    // Idempotency TTLs
    pub intraday_ref_ttl: Duration,
    pub fill_ref_ttl: Duration,

    // Trade aggregation
    pub order_state_ttl: Duration,
    pub fill_count_cap: u64,
    pub orphan_scan_interval: Duration,
    pub orphan_threshold: Duration,
    pub forward_maturity_horizon_days: i64,

    // Price / FX cache
    pub price_l1_cap: usize,
    pub fx_l1_cap: usize,
    pub price_l1_ttl: Duration,
    pub fx_l1_ttl: Duration,
    pub l2_ttl: Duration,
    pub stale_override: Duration,
    pub stale_realtime: Duration,
    pub stale_rcp_snap: Duration,
    pub stale_mspa: Duration,

    // Price service
    pub conflation_flush_interval: Duration,
    pub price_flush_interval: Duration,
    pub pivot_currency: String,
    pub notification_mode: NotificationMode,

    // Shutdown
    pub shutdown_grace: Duration,
    pub cleanup_grace: Duration,

    pub dependencies: DependencyConfigs,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let total_shards: u32 = env_parse("HL_TOTAL_SHARDS", 1);
        anyhow::ensure!(total_shards > 0, "HL_TOTAL_SHARDS must be positive");
        let shard_index: u32 = env_parse("HL_SHARD_INDEX", 0);
        anyhow::ensure!(
            shard_index < total_shards,
            "HL_SHARD_INDEX {} out of range for {} shards",
            shard_index,
            total_shards
        );

        let eod_deadline = NaiveTime::parse_from_str(&env_str("HL_EOD_DEADLINE", "18:00"), "%H:%M")
            .map_err(|e| anyhow::anyhow!("bad HL_EOD_DEADLINE: {e}"))?;

        Ok(Self {
            database_path: env_str("DATABASE_PATH", "./hedgeline.db"),
            shard_index,
            total_shards,
            eod_deadline,
            validation_error_threshold: env_parse("HL_VALIDATION_ERROR_THRESHOLD", 0.1),
            intraday_ref_ttl: env_millis("HL_INTRADAY_REF_TTL_MS", 60 * 60 * 1_000),
            fill_ref_ttl: env_millis("HL_FILL_REF_TTL_MS", 24 * 60 * 60 * 1_000),
            order_state_ttl: env_millis("HL_ORDER_STATE_TTL_MS", 4 * 60 * 60 * 1_000),
            fill_count_cap: env_parse("HL_FILL_COUNT_CAP", 1_000),
            orphan_scan_interval: env_millis("HL_ORPHAN_SCAN_INTERVAL_MS", 5 * 60 * 1_000),
            orphan_threshold: env_millis("HL_ORPHAN_THRESHOLD_MS", 30 * 60 * 1_000),
            forward_maturity_horizon_days: env_parse("HL_FORWARD_MATURITY_HORIZON_DAYS", 7),
            price_l1_cap: env_parse("HL_PRICE_L1_CAP", 50_000),
            fx_l1_cap: env_parse("HL_FX_L1_CAP", 1_000),
            price_l1_ttl: env_millis("HL_PRICE_L1_TTL_MS", 30_000),
            fx_l1_ttl: env_millis("HL_FX_L1_TTL_MS", 60_000),
            l2_ttl: env_millis("HL_L2_TTL_MS", 5 * 60 * 1_000),
            stale_override: env_millis("HL_STALE_OVERRIDE_MS", 7 * 24 * 60 * 60 * 1_000),
            stale_realtime: env_millis("HL_STALE_REALTIME_MS", 30_000),
            stale_rcp_snap: env_millis("HL_STALE_RCP_SNAP_MS", 24 * 60 * 60 * 1_000),
            stale_mspa: env_millis("HL_STALE_MSPA_MS", 24 * 60 * 60 * 1_000),
            conflation_flush_interval: env_millis("HL_CONFLATION_FLUSH_MS", 250),
            price_flush_interval: env_millis("HL_PRICE_FLUSH_MS", 1_000),
            pivot_currency: env_str("HL_PIVOT_CURRENCY", "USD"),
            notification_mode: NotificationMode::parse(&env_str("HL_NOTIFICATION_MODE", "BOTH")),
            shutdown_grace: env_millis("HL_SHUTDOWN_GRACE_MS", 10_000),
            cleanup_grace: env_millis("HL_CLEANUP_GRACE_MS", 5_000),
            dependencies: DependencyConfigs::from_env(),
        })
    }

    /// Shard ownership: `|account_id| mod total_shards == shard_index`.
    pub fn owns_account(&self, account_id: i64) -> bool {
        account_id.unsigned_abs() % self.total_shards as u64 == self.shard_index as u64
    }

    /// Per-source maximum age before a cached price is stale.
    pub fn max_age(&self, source: PriceSource) -> Duration {
        match source {
            PriceSource::Override => self.stale_override,
            PriceSource::Realtime => self.stale_realtime,
            PriceSource::RcpSnap => self.stale_rcp_snap,
            PriceSource::Mspa => self.stale_mspa,
        }
    }
}

impl Default for Config {
    /// Test/default configuration; identical to an empty environment.
    fn default() -> Self {
        Self::from_env().expect("default config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_ownership() {
        let mut cfg = Config::default();
        cfg.total_shards = 3;
        cfg.shard_index = 1;
        assert!(cfg.owns_account(1));
        assert!(cfg.owns_account(-1));
        assert!(cfg.owns_account(1000)); // 1000 % 3 == 1
        assert!(!cfg.owns_account(1001)); // 1001 % 3 == 2
        assert!(!cfg.owns_account(1002)); // 1002 % 3 == 0
    }

    #[test]
    fn test_notification_mode_parse() {
        assert_eq!(NotificationMode::parse("direct"), NotificationMode::Direct);
        assert_eq!(NotificationMode::parse("FABRIC"), NotificationMode::Fabric);
        assert_eq!(NotificationMode::parse("anything"), NotificationMode::Both);
        assert!(NotificationMode::Both.includes_direct());
        assert!(NotificationMode::Both.includes_fabric());
    }

    #[test]
    fn test_per_source_staleness_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.max_age(PriceSource::Realtime), Duration::from_secs(30));
        assert_eq!(
            cfg.max_age(PriceSource::RcpSnap),
            Duration::from_secs(24 * 60 * 60)
        );
    }
}
