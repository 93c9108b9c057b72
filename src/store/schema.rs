//! Database Schema
//!
//! SQLite with WAL mode for concurrent reads during writes. Decimals are
//! stored as TEXT to keep exact scale; dates as ISO-8601 TEXT; system-time
//! instants as epoch-millisecond INTEGERs with `9223372036854775807`
//! (i64::MAX) marking an open interval.

/// Schema with optimizations for the EOD insert and intraday update hot paths
pub const SCHEMA_SQL: &str = r#"
-- Enable WAL mode for better concurrent access
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;  -- 64MB cache
PRAGMA temp_store = MEMORY;

-- Reference hierarchy: account -> fund -> client, replicated from snapshots
CREATE TABLE IF NOT EXISTS accounts (
    account_id INTEGER PRIMARY KEY,
    account_number TEXT NOT NULL,
    account_type TEXT NOT NULL,
    fund_id INTEGER NOT NULL,
    fund_name TEXT NOT NULL,
    client_id INTEGER NOT NULL,
    client_name TEXT NOT NULL,
    base_currency TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_accounts_client ON accounts(client_id);

CREATE TABLE IF NOT EXISTS products (
    product_id INTEGER PRIMARY KEY,
    identifier_type TEXT NOT NULL,
    identifier TEXT NOT NULL,
    ticker TEXT NOT NULL,
    asset_class TEXT NOT NULL,
    issue_currency TEXT NOT NULL,
    settlement_currency TEXT NOT NULL,
    risk_region TEXT,
    active INTEGER NOT NULL DEFAULT 1
);

-- (identifier_type, identifier) unique among active products
CREATE UNIQUE INDEX IF NOT EXISTS idx_products_identifier
    ON products(identifier_type, identifier) WHERE active = 1;

CREATE INDEX IF NOT EXISTS idx_products_ticker ON products(ticker);

-- Exactly one active batch per account; last_batch_id is the reservation
-- sequence
CREATE TABLE IF NOT EXISTS batch_control (
    account_id INTEGER PRIMARY KEY,
    active_batch_id INTEGER,
    last_batch_id INTEGER NOT NULL DEFAULT 0
);

-- Bitemporal position rows. Staged (pre-activation) rows carry
-- system_from = i64::MAX so they are invisible to system-time queries
-- until the batch swap stamps them.
CREATE TABLE IF NOT EXISTS positions (
    position_id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL,
    product_id INTEGER NOT NULL,
    batch_id INTEGER NOT NULL,
    business_date TEXT NOT NULL,
    quantity TEXT NOT NULL,
    price_used TEXT NOT NULL,
    fx_rate_used TEXT NOT NULL,
    market_value_local TEXT NOT NULL,
    market_value_base TEXT NOT NULL,
    cost_basis_local TEXT NOT NULL,
    cost_basis_base TEXT NOT NULL,
    unrealized_pnl_local TEXT NOT NULL,
    unrealized_pnl_base TEXT NOT NULL,
    source_system TEXT NOT NULL,
    position_type TEXT NOT NULL,
    excluded INTEGER NOT NULL DEFAULT 0,
    valid_from TEXT NOT NULL,
    valid_to TEXT NOT NULL,
    system_from INTEGER NOT NULL,
    system_to INTEGER NOT NULL
);

-- (account, product) unique among open rows of a batch
CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_current
    ON positions(account_id, product_id, batch_id)
    WHERE system_to = 9223372036854775807;

CREATE INDEX IF NOT EXISTS idx_positions_batch
    ON positions(account_id, batch_id, system_to);

CREATE INDEX IF NOT EXISTS idx_positions_product
    ON positions(product_id) WHERE system_to = 9223372036854775807;

CREATE INDEX IF NOT EXISTS idx_positions_system_time
    ON positions(account_id, product_id, system_from);

CREATE TABLE IF NOT EXISTS eod_daily_status (
    account_id INTEGER NOT NULL,
    business_date TEXT NOT NULL,
    status TEXT NOT NULL,
    completed_at INTEGER,
    position_count INTEGER,
    error_text TEXT,
    PRIMARY KEY (account_id, business_date)
) WITHOUT ROWID;

-- Exactly-once sign-off claim per (client, business date)
CREATE TABLE IF NOT EXISTS client_signoff (
    client_id INTEGER NOT NULL,
    business_date TEXT NOT NULL,
    account_count INTEGER NOT NULL,
    signed_at INTEGER NOT NULL,
    PRIMARY KEY (client_id, business_date)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS prices (
    product_id INTEGER NOT NULL,
    price_date TEXT NOT NULL,
    source TEXT NOT NULL,
    price_value TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (product_id, price_date, source)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS fx_rates (
    currency_pair TEXT NOT NULL,
    rate_date TEXT NOT NULL,
    source TEXT NOT NULL,
    spot_rate TEXT NOT NULL,
    forward_points TEXT,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (currency_pair, rate_date, source)
) WITHOUT ROWID;

-- Append-only fills log; exec_id is the on-disk idempotency key
CREATE TABLE IF NOT EXISTS fills (
    exec_id TEXT PRIMARY KEY,
    client_order_id TEXT NOT NULL,
    account_id INTEGER NOT NULL,
    ticker TEXT NOT NULL,
    side TEXT NOT NULL,
    last_qty TEXT NOT NULL,
    last_px TEXT NOT NULL,
    cum_qty TEXT NOT NULL,
    order_status TEXT NOT NULL,
    ts INTEGER NOT NULL,
    recorded_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_fills_order ON fills(client_order_id, ts);

CREATE TABLE IF NOT EXISTS order_summary (
    client_order_id TEXT PRIMARY KEY,
    external_order_id TEXT,
    account_id INTEGER NOT NULL,
    ticker TEXT NOT NULL,
    side TEXT NOT NULL,
    filled_qty TEXT NOT NULL,
    notional TEXT NOT NULL,
    fill_count INTEGER NOT NULL,
    status TEXT NOT NULL,
    vwap TEXT,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS forward_contracts (
    client_order_id TEXT PRIMARY KEY,
    account_id INTEGER NOT NULL,
    currency_pair TEXT NOT NULL,
    notional TEXT NOT NULL,
    forward_rate TEXT NOT NULL,
    maturity_date TEXT NOT NULL,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_forwards_maturity
    ON forward_contracts(maturity_date);

CREATE TABLE IF NOT EXISTS audit_log (
    audit_id INTEGER PRIMARY KEY AUTOINCREMENT,
    actor TEXT NOT NULL,
    action TEXT NOT NULL,
    account_id INTEGER,
    detail TEXT,
    ts INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_log(ts DESC);
"#;
