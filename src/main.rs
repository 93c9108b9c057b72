//! Hedgeline - FX Position & Trade-Lifecycle Platform
//!
//! Orchestrator binary: wires the Position Loader, Price service and Trade
//! aggregator over the in-process messaging fabric, starts the scheduled
//! scans, and runs until interrupted.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hedgeline_backend::aggregator::{OrphanScanner, TradeAggregator};
use hedgeline_backend::cache::{
    IdempotencyStore, ReverseIndex, SymbologyResolver, TieredCache,
};
use hedgeline_backend::clock::{Clock, SystemClock};
use hedgeline_backend::config::Config;
use hedgeline_backend::errors::PlatformError;
use hedgeline_backend::fabric::{register_platform_topics, Broker};
use hedgeline_backend::kv::InMemoryKv;
use hedgeline_backend::loader::{PositionFeed, PositionLoader};
use hedgeline_backend::models::AccountSnapshot;
use hedgeline_backend::pricing::{FxConverter, PriceService, SubscriptionHub};
use hedgeline_backend::resilience::DependencyGuards;
use hedgeline_backend::shutdown::ShutdownCoordinator;
use hedgeline_backend::store::{
    AuditStore, Database, EodStore, FillStore, PositionStore, PriceStore, RefDataStore,
};

#[derive(Parser, Debug)]
#[command(name = "hedgeline", about = "FX position & trade-lifecycle platform")]
struct Args {
    /// Shard index of this instance
    #[arg(long, env = "HL_SHARD_INDEX")]
    shard_index: Option<u32>,

    /// Total shard count
    #[arg(long, env = "HL_TOTAL_SHARDS")]
    total_shards: Option<u32>,

    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH")]
    database_path: Option<String>,

    /// Directory of per-account snapshot files for the upstream feed seam
    #[arg(long, env = "HL_SNAPSHOT_DIR", default_value = "./snapshots")]
    snapshot_dir: PathBuf,
}

/// File-backed upstream feed: one JSON `AccountSnapshot` per
/// `{account_id}_{business_date}.json`. The production connector replaces
/// this behind the same trait.
struct FileSnapshotFeed {
    dir: PathBuf,
}

#[async_trait]
impl PositionFeed for FileSnapshotFeed {
    async fn fetch_snapshot(
        &self,
        account_id: i64,
        business_date: chrono::NaiveDate,
    ) -> hedgeline_backend::Result<AccountSnapshot> {
        let path = self
            .dir
            .join(format!("{account_id}_{business_date}.json"));
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            PlatformError::UpstreamUnavailable(format!("{}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| PlatformError::Parse(e.to_string()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let recorder = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("install metrics recorder")?;

    let args = Args::parse();
    let mut cfg = Config::from_env()?;
    if let Some(shard_index) = args.shard_index {
        cfg.shard_index = shard_index;
    }
    if let Some(total_shards) = args.total_shards {
        cfg.total_shards = total_shards;
    }
    if let Some(database_path) = args.database_path {
        cfg.database_path = database_path;
    }
    let cfg = Arc::new(cfg);
    info!(
        shard = cfg.shard_index,
        shards = cfg.total_shards,
        db = %cfg.database_path,
        "hedgeline starting"
    );

    // --- shared infrastructure ---
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let db = Database::open(&cfg.database_path)?;
    let kv = Arc::new(InMemoryKv::new(clock.clone()));
    let kv_dyn: Arc<dyn hedgeline_backend::kv::KvStore> = kv.clone();
    let broker = Arc::new(Broker::new());
    register_platform_topics(&broker);
    let guards = Arc::new(DependencyGuards::from_config(&cfg, clock.clone()));

    // --- stores ---
    let positions = Arc::new(PositionStore::new(db.clone(), clock.clone()));
    let eod = Arc::new(EodStore::new(db.clone()));
    let refdata = Arc::new(RefDataStore::new(db.clone()));
    let audit = Arc::new(AuditStore::new(db.clone()));
    let fills = Arc::new(FillStore::new(db.clone()));
    let price_store = Arc::new(PriceStore::new(db, clock.clone()));

    // --- caches ---
    let cache = Arc::new(TieredCache::new(cfg.clone(), clock.clone(), kv_dyn.clone()));
    cache.set_backstop(price_store.clone());
    let fx = Arc::new(FxConverter::new(cache.clone(), cfg.pivot_currency.clone()));
    let symbology = Arc::new(SymbologyResolver::new());
    let reverse_index = Arc::new(ReverseIndex::new());
    let intraday_refs = Arc::new(IdempotencyStore::new(
        kv_dyn.clone(),
        "intraday",
        cfg.intraday_ref_ttl,
    ));
    let exec_refs = Arc::new(IdempotencyStore::new(kv_dyn.clone(), "fill", cfg.fill_ref_ttl));

    // --- services ---
    let feed: Arc<dyn PositionFeed> = Arc::new(FileSnapshotFeed {
        dir: args.snapshot_dir,
    });
    let loader = Arc::new(PositionLoader::new(
        cfg.clone(),
        clock.clone(),
        broker.clone(),
        positions.clone(),
        eod.clone(),
        refdata.clone(),
        audit.clone(),
        feed,
        fx.clone(),
        intraday_refs,
        guards.clone(),
    ));
    let hub = Arc::new(SubscriptionHub::new(1024));
    let pricing = Arc::new(PriceService::new(
        cfg.clone(),
        clock.clone(),
        broker.clone(),
        cache,
        fx,
        symbology,
        reverse_index,
        positions,
        refdata,
        price_store,
        guards.clone(),
        hub,
    ));
    let aggregator = Arc::new(TradeAggregator::new(
        cfg.clone(),
        clock.clone(),
        broker.clone(),
        kv_dyn.clone(),
        fills.clone(),
        exec_refs,
        guards,
    ));
    let orphan_scanner = Arc::new(OrphanScanner::new(
        cfg.clone(),
        clock.clone(),
        kv_dyn,
        fills,
        audit,
    ));

    pricing.rebuild().context("reverse index rebuild")?;

    // Direct (out-of-band) cache-invalidation path, fabric as fallback
    let direct_rx = if cfg.notification_mode.includes_direct() {
        let (tx, rx) = mpsc::unbounded_channel();
        loader.set_direct_notifier(tx);
        Some(rx)
    } else {
        None
    };

    // --- spawn everything ---
    let coordinator = ShutdownCoordinator::new();
    for handle in loader.spawn_consumers(coordinator.signal()) {
        coordinator.register_task(handle);
    }
    for handle in pricing.spawn(coordinator.signal(), direct_rx) {
        coordinator.register_task(handle);
    }
    for handle in aggregator.spawn_consumers(coordinator.signal()) {
        coordinator.register_task(handle);
    }
    coordinator.register_task(orphan_scanner.spawn(coordinator.signal()));

    // EOD deadline watchdog + forward maturity alerts
    {
        let loader = loader.clone();
        let aggregator = aggregator.clone();
        let mut shutdown = coordinator.signal();
        coordinator.register_task(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = loader.check_deadline() {
                            warn!(error = %err, "deadline check failed");
                        }
                        if let Err(err) = aggregator.forward_maturity_scan() {
                            warn!(error = %err, "forward maturity scan failed");
                        }
                    }
                }
            }
        }));
    }

    // KV TTL sweep + periodic stats
    {
        let kv = kv.clone();
        let loader = loader.clone();
        let pricing = pricing.clone();
        let aggregator = aggregator.clone();
        let broker = broker.clone();
        let mut shutdown = coordinator.signal();
        coordinator.register_task(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {
                        let purged = kv.sweep();
                        info!(
                            kv_purged = purged,
                            loader = ?loader.stats().snapshot(),
                            pricing = ?pricing.stats().snapshot(),
                            aggregator = ?aggregator.stats().snapshot(),
                            published = broker.stats().published.load(std::sync::atomic::Ordering::Relaxed),
                            "platform stats"
                        );
                    }
                }
            }
        }));
    }

    // Final metrics render goes to the log on shutdown
    coordinator.register_cleanup("metrics-render", async move {
        info!(metrics = %recorder.render(), "final metrics");
    });

    info!("hedgeline running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
    coordinator
        .shutdown(cfg.shutdown_grace, cfg.cleanup_grace)
        .await;
    Ok(())
}
