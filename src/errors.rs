//! Platform Error Taxonomy
//!
//! One flat error union for the whole data-flow spine. Every variant carries
//! a namespaced code with a numeric suffix and a retryable classification
//! consumed by the retry layer and the consumer loops. Codes are unique:
//! one code, one meaning, one classification.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    // --- Upstream feed ---
    #[error("upstream feed unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream feed timed out after {0:?}")]
    UpstreamTimeout(Duration),

    // --- Validation ---
    #[error("validation failed on {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("zero price for product {product_id} from source {source_name}")]
    ZeroPrice { product_id: i64, source_name: String },

    #[error("invalid currency code: {0}")]
    InvalidCurrency(String),

    #[error("snapshot rejected: {rejected} of {total} rows failed validation")]
    SnapshotRejected { rejected: usize, total: usize },

    // --- Storage ---
    #[error("database error: {0}")]
    Database(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("database busy or deadlocked: {0}")]
    DbContention(String),

    #[error("key/value store unavailable: {0}")]
    KvUnavailable(String),

    // --- Idempotency / lifecycle ---
    #[error("duplicate external reference: {0}")]
    DuplicateRef(String),

    #[error("order {0} is terminal; further reports rejected")]
    OrderTerminal(String),

    #[error("batch conflict: {0}")]
    BatchConflict(String),

    #[error("invalid EOD status transition: {0}")]
    EodTransition(String),

    // --- Messaging ---
    #[error("publish to topic {0} failed")]
    PublishFailed(String),

    #[error("payload parse failed: {0}")]
    Parse(String),

    // --- Resilience ---
    #[error("circuit open for dependency {0}")]
    CircuitOpen(String),

    #[error("rate limited on dependency {0}")]
    RateLimited(String),

    #[error("call to dependency {dependency} timed out after {timeout:?}")]
    CallTimeout {
        dependency: String,
        timeout: Duration,
    },

    // --- Sharding ---
    #[error("account {0} is not owned by this shard")]
    ShardMismatch(i64),
}

impl PlatformError {
    /// Namespaced error code with numeric suffix. The single authoritative
    /// enumeration: a code never maps to two meanings.
    pub fn code(&self) -> &'static str {
        match self {
            PlatformError::UpstreamUnavailable(_) => "MSPM_UNAVAILABLE-101",
            PlatformError::UpstreamTimeout(_) => "MSPM_TIMEOUT-102",
            PlatformError::Validation { .. } => "VALIDATION_FAILED-201",
            PlatformError::ZeroPrice { .. } => "ZERO_PRICE_DETECTED-202",
            PlatformError::InvalidCurrency(_) => "INVALID_CURRENCY-203",
            PlatformError::SnapshotRejected { .. } => "SNAPSHOT_REJECTED-204",
            PlatformError::Database(_) => "DB_ERROR-301",
            PlatformError::Constraint(_) => "DB_CONSTRAINT-302",
            PlatformError::DbContention(_) => "DB_DEADLOCK-304",
            PlatformError::KvUnavailable(_) => "KV_UNAVAILABLE-305",
            PlatformError::DuplicateRef(_) => "IDEMPOTENCY_VIOLATION-404",
            PlatformError::OrderTerminal(_) => "ORDER_TERMINAL-405",
            PlatformError::BatchConflict(_) => "BATCH_CONFLICT-406",
            PlatformError::EodTransition(_) => "EOD_TRANSITION-407",
            PlatformError::PublishFailed(_) => "PUBLISH_FAILED-501",
            PlatformError::Parse(_) => "PARSE_FAILED-502",
            PlatformError::CircuitOpen(_) => "CIRCUIT_OPEN-601",
            PlatformError::RateLimited(_) => "RATE_LIMITED-602",
            PlatformError::CallTimeout { .. } => "CALL_TIMEOUT-603",
            PlatformError::ShardMismatch(_) => "SHARD_MISMATCH-701",
        }
    }

    /// Whether the retry layer may re-attempt the failed call.
    ///
    /// Circuit-open and rate-limited are deliberate fast-fails: the caller
    /// decides the fallback, the retry layer must not hammer them.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            PlatformError::UpstreamUnavailable(_)
                | PlatformError::UpstreamTimeout(_)
                | PlatformError::DbContention(_)
                | PlatformError::PublishFailed(_)
                | PlatformError::CallTimeout { .. }
        )
    }
}

impl From<rusqlite::Error> for PlatformError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    PlatformError::DbContention(err.to_string())
                }
                rusqlite::ErrorCode::ConstraintViolation => {
                    PlatformError::Constraint(err.to_string())
                }
                _ => PlatformError::Database(err.to_string()),
            },
            _ => PlatformError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for PlatformError {
    fn from(err: serde_json::Error) -> Self {
        PlatformError::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PlatformError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sample_errors() -> Vec<PlatformError> {
        vec![
            PlatformError::UpstreamUnavailable("conn reset".into()),
            PlatformError::UpstreamTimeout(Duration::from_secs(15)),
            PlatformError::Validation {
                field: "quantity".into(),
                reason: "missing".into(),
            },
            PlatformError::ZeroPrice {
                product_id: 42,
                source_name: "REALTIME".into(),
            },
            PlatformError::InvalidCurrency("EURO".into()),
            PlatformError::SnapshotRejected {
                rejected: 3,
                total: 5,
            },
            PlatformError::Database("io".into()),
            PlatformError::Constraint("unique".into()),
            PlatformError::DbContention("busy".into()),
            PlatformError::KvUnavailable("down".into()),
            PlatformError::DuplicateRef("REF-X".into()),
            PlatformError::OrderTerminal("ORD-1".into()),
            PlatformError::BatchConflict("not reserved".into()),
            PlatformError::EodTransition("COMPLETED -> IN_PROGRESS".into()),
            PlatformError::PublishFailed("MARKET_DATA_TICKS".into()),
            PlatformError::Parse("bad json".into()),
            PlatformError::CircuitOpen("database".into()),
            PlatformError::RateLimited("upstream_feed".into()),
            PlatformError::CallTimeout {
                dependency: "kv".into(),
                timeout: Duration::from_millis(500),
            },
            PlatformError::ShardMismatch(1001),
        ]
    }

    #[test]
    fn test_codes_are_unique() {
        let errors = sample_errors();
        let codes: HashSet<&str> = errors.iter().map(|e| e.code()).collect();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(PlatformError::UpstreamUnavailable("x".into()).retryable());
        assert!(PlatformError::DbContention("x".into()).retryable());
        assert!(!PlatformError::DuplicateRef("x".into()).retryable());
        assert!(!PlatformError::ZeroPrice {
            product_id: 1,
            source_name: "MSPA".into()
        }
        .retryable());
        // Fast-fail kinds are not locally retryable
        assert!(!PlatformError::CircuitOpen("db".into()).retryable());
        assert!(!PlatformError::RateLimited("db".into()).retryable());
    }

    #[test]
    fn test_codes_carry_namespace_and_suffix() {
        for err in sample_errors() {
            let code = err.code();
            let (name, suffix) = code.rsplit_once('-').expect("code has suffix");
            assert!(!name.is_empty());
            assert!(suffix.parse::<u32>().is_ok(), "bad suffix in {code}");
        }
    }
}
