use bar_signal_trader::collector::{OrderBookCollector, SnapshotStore};
use bar_signal_trader::market::sim::{FillBehavior, SimulatedMarket};
use bar_signal_trader::metrics::RuntimeMetrics;
use bar_signal_trader::model::{JsonArtifactStore, ModelStore};
use bar_signal_trader::notify::{LogSink, NotificationSink};
use bar_signal_trader::{BotConfig, Context, Orchestrator};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Runs the trading cycle and the order-book collector against the
/// simulated market until Ctrl-C.
#[derive(Parser, Debug)]
#[command(name = "bot")]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "BOT_CONFIG", default_value = "demos/config.json")]
    config: PathBuf,

    /// Force shadow mode regardless of the config file.
    #[arg(long)]
    shadow: bool,

    /// Emit logs as JSON lines.
    #[arg(long, env = "BOT_JSON_LOGS")]
    json_logs: bool,

    /// Quote balance of the simulated account.
    #[arg(long, default_value_t = 10_000.0)]
    paper_quote: f64,

    #[arg(long, default_value_t = 30_000.0)]
    start_price: f64,

    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Interval between synthetic book updates.
    #[arg(long, default_value_t = 250)]
    book_interval_ms: u64,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let mut cfg = BotConfig::from_path(&args.config)?;
    if args.shadow {
        cfg.trader.shadow = true;
    }

    let market = Arc::new(
        SimulatedMarket::new(cfg.frequency, cfg.trader.base_asset.clone(), cfg.trader.quote_asset.clone())
            .with_random_walk(args.start_price, args.seed)
            .with_synthetic_book(Duration::from_millis(args.book_interval_ms)),
    );
    market.set_balance(&cfg.trader.quote_asset, args.paper_quote);
    market.set_fill_behavior(FillBehavior::Immediate);

    let artifacts = JsonArtifactStore::new(&cfg.models.dir);
    let models = ModelStore::load(&artifacts, &cfg.models.labels, &cfg.models.algorithms, cfg.score.clone())?;

    let snapshots = if cfg.collector.enabled {
        Some(Arc::new(SnapshotStore::open(&cfg.collector.dir, cfg.collector.depth)?))
    } else {
        None
    };
    let metrics = Arc::new(RuntimeMetrics::new());
    let notifier: Arc<dyn NotificationSink> = Arc::new(LogSink);
    let ctx = Arc::new(Context::new(cfg.clone(), models, snapshots.clone(), notifier, metrics.clone())?);

    let (stop_tx, stop_rx) = watch::channel(false);
    let stopped = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.changed().await;
    };

    let collector = snapshots.map(|store| {
        let collector = OrderBookCollector::new(
            market.clone(),
            cfg.instrument.clone(),
            store,
            cfg.collector.clone(),
            metrics.clone(),
        );
        tokio::spawn(collector.run(stopped(stop_rx.clone())))
    });

    let orchestrator = Orchestrator::start(ctx, market.clone(), Utc::now()).await?;
    let scheduler = tokio::spawn({
        let stop = stopped(stop_rx.clone());
        async move { orchestrator.run(stop).await }
    });

    info!(
        instrument = %cfg.instrument,
        shadow = cfg.trader.shadow,
        collector = cfg.collector.enabled,
        "bot running, Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = stop_tx.send(true);

    scheduler.await?;
    if let Some(handle) = collector {
        let summary = handle.await??;
        info!(?summary, "collector flushed");
    }

    println!("{}", serde_json::to_string_pretty(&metrics.snapshot_kv())?);
    Ok(())
}
