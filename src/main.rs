//! mmbot - Main Entry Point
//!
//! Runs the configured traders against in-memory paper brokers.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mmbot_core::config::Config;
use mmbot_core::engine::{Traders, WorkerPool};
use mmbot_core::exchange::{Brokers, Exchange, PaperExchange};
use mmbot_core::persistence::StateStore;
use mmbot_core::report::MemoryReporter;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// mmbot CLI
#[derive(Parser)]
#[command(name = "mmbot")]
#[command(version, about = "Multi-pair market-making bot")]
struct Cli {
    /// Configuration file (defaults to mmbot.toml in the working directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the traders against the paper brokers
    Run {
        /// Exit after this many cycles
        #[arg(long)]
        cycles: Option<u64>,
    },

    /// Show the saved state of every trader
    Status {
        /// Path to SQLite database (defaults to the configured one)
        #[arg(short, long)]
        db: Option<String>,
    },

    /// Validate the configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    let config_path = cli.config.as_deref();
    match cli.command {
        Some(Commands::Status { db }) => show_status(config_path, db),
        Some(Commands::Check) => check_config(config_path),
        Some(Commands::Run { cycles }) => run(config_path, cycles).await,
        None => run(config_path, None).await,
    }
}

async fn run(config_path: Option<&Path>, max_cycles: Option<u64>) -> Result<()> {
    info!("mmbot v{} starting", env!("CARGO_PKG_VERSION"));

    let config = Config::load(config_path)?;
    config.validate()?;
    log_config(&config);

    if let Some(dir) = Path::new(&config.engine.db_path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {:?}", dir))?;
        }
    }
    let store = Arc::new(StateStore::new(&config.engine.db_path)?);
    let reporter = Arc::new(MemoryReporter::new());

    let paper = build_paper_brokers(&config).await?;
    let brokers: Brokers = paper
        .iter()
        .map(|(name, ex)| (name.clone(), ex.clone() as Arc<dyn Exchange>))
        .collect();

    let traders = Arc::new(Traders::new(brokers, store, reporter));
    let pool = WorkerPool::new(config.engine.worker_threads);
    load_generation(&traders, &config).await;

    let shutdown = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());
    {
        let shutdown = shutdown.clone();
        let wake = wake.clone();
        let traders = traders.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
            traders.stop_cycle();
            wake.notify_one();
        });
    }

    let mut watcher = ConfigWatcher::new(config_path);
    let mut replay = Replay::new(&config);
    let mut interval_secs = config.engine.cycle_interval_secs;
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    let mut cycles = 0u64;

    while !shutdown.load(Ordering::SeqCst) {
        tokio::select! {
            _ = interval.tick() => {}
            _ = wake.notified() => break,
        }

        if let Some(next) = watcher.poll() {
            if next.paper != config.paper {
                warn!("Paper broker changes take effect after a restart");
            }
            replay = Replay::new(&next);
            load_generation(&traders, &next).await;
            if next.engine.cycle_interval_secs != interval_secs {
                interval_secs = next.engine.cycle_interval_secs;
                interval = tokio::time::interval(Duration::from_secs(interval_secs));
                interval.tick().await;
            }
        }

        replay.step(&paper).await;
        let completed = traders.cycle(&pool).await;
        cycles += 1;

        let util = traders.utilization();
        if let Some(elapsed) = util.last_cycle {
            info!(cycle = cycles, elapsed_ms = elapsed.as_millis() as u64, completed, "Cycle finished");
        }
        for (id, took) in &util.per_trader {
            debug!(trader = %id, elapsed_ms = took.as_millis() as u64, "Trader utilization");
        }
        for s in traders.status().await {
            if let Some(err) = &s.errors.generic {
                warn!(trader = %s.id, error = %err, "Trader reports an error");
            }
        }
        for (name, ex) in &paper {
            ex.log_balances(name).await;
        }

        if max_cycles.is_some_and(|max| cycles >= max) {
            info!(cycles, "Cycle limit reached");
            break;
        }
    }

    if traders.is_stopped() {
        info!("Cancelling orders after stop request");
    }
    traders.shutdown_all().await;
    info!("mmbot shutdown complete");
    Ok(())
}

/// Stage every configured trader and swap them in.
async fn load_generation(traders: &Traders, config: &Config) {
    let mut generation = traders.begin_add();
    for (id, trader_config) in &config.traders {
        if let Err(e) = generation.add_trader(id, trader_config.clone()) {
            warn!(trader = %id, error = %e, "Trader skipped");
        }
    }
    let summary = traders.commit_add(generation).await;
    for (id, err) in &summary.failed {
        warn!(trader = %id, error = %err, "Trader not ready yet");
    }
    info!(
        live = summary.live.len(),
        removed = summary.removed.len(),
        "Traders loaded"
    );
}

async fn build_paper_brokers(config: &Config) -> Result<BTreeMap<String, Arc<PaperExchange>>> {
    let mut out = BTreeMap::new();
    for (name, broker) in &config.paper {
        let ex = Arc::new(PaperExchange::new());
        for (pair, market) in &broker.markets {
            let (bid, ask) = market.quote(market.price);
            ex.add_market(pair, market.market_info(), bid, ask).await;
        }
        for (wallet, symbols) in &broker.balances {
            for (symbol, amount) in symbols {
                ex.set_balance(wallet, &symbol.to_uppercase(), *amount).await;
            }
        }
        info!(broker = %name, markets = broker.markets.len(), "Paper broker ready");
        out.insert(name.clone(), ex);
    }
    anyhow::ensure!(!out.is_empty(), "No paper brokers configured");
    Ok(out)
}

/// Feeds each market's replay prices to the paper brokers, one per cycle.
struct Replay {
    feeds: Vec<(String, String, Vec<f64>, f64)>,
    step: usize,
}

impl Replay {
    fn new(config: &Config) -> Self {
        let feeds = config
            .paper
            .iter()
            .flat_map(|(broker, b)| {
                b.markets.iter().filter(|(_, m)| !m.replay.is_empty()).map(|(pair, m)| {
                    (broker.clone(), pair.clone(), m.replay.clone(), m.spread)
                })
            })
            .collect();
        Self { feeds, step: 0 }
    }

    /// Replays wrap around when exhausted.
    async fn step(&mut self, paper: &BTreeMap<String, Arc<PaperExchange>>) {
        for (broker, pair, prices, spread) in &self.feeds {
            let Some(ex) = paper.get(broker) else {
                continue;
            };
            let mid = prices[self.step % prices.len()];
            if let Err(e) = ex.set_ticker(pair, mid * (1.0 - spread), mid * (1.0 + spread)).await {
                warn!(broker = %broker, %pair, error = %e, "Replay price rejected");
            }
        }
        self.step += 1;
    }
}

/// Detects config file changes by modification time.
struct ConfigWatcher {
    path: Option<PathBuf>,
    file: PathBuf,
    modified: Option<SystemTime>,
}

impl ConfigWatcher {
    fn new(path: Option<&Path>) -> Self {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("mmbot.toml"));
        let modified = modified_time(&file);
        Self {
            path: path.map(Path::to_path_buf),
            file,
            modified,
        }
    }

    /// A freshly loaded config when the file changed and still validates.
    fn poll(&mut self) -> Option<Config> {
        let modified = modified_time(&self.file);
        if modified == self.modified {
            return None;
        }
        self.modified = modified;
        info!(file = ?self.file, "Configuration changed, reloading");

        match Config::load(self.path.as_deref()).and_then(|c| c.validate().map(|_| c)) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Reload rejected, keeping current traders");
                None
            }
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn check_config(config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;
    config.validate()?;
    log_config(&config);
    println!(
        "Configuration OK: {} paper broker(s), {} trader(s)",
        config.paper.len(),
        config.traders.len()
    );
    Ok(())
}

fn show_status(config_path: Option<&Path>, db: Option<String>) -> Result<()> {
    let db_path = match db {
        Some(db) => db,
        None => Config::load(config_path)?.engine.db_path,
    };

    if !Path::new(&db_path).exists() {
        println!("Database not found: {}", db_path);
        println!("mmbot has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let store = StateStore::new(&db_path)?;
    let traders = store.list()?;
    if traders.is_empty() {
        println!("No saved trader state in {}", db_path);
        return Ok(());
    }

    println!("{:<20} {:>14} {:>8} {:>8}  {}", "TRADER", "POSITION", "TRADES", "STOPPED", "UPDATED");
    for t in traders {
        println!(
            "{:<20} {:>14.6} {:>8} {:>8}  {}",
            t.id,
            t.position,
            t.trades,
            if t.stopped { "yes" } else { "no" },
            t.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "mmbot.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("mmbot_core=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

fn log_config(config: &Config) {
    info!(
        interval_secs = config.engine.cycle_interval_secs,
        workers = config.engine.worker_threads,
        db = %config.engine.db_path,
        "Engine configuration"
    );
    for (name, broker) in &config.paper {
        for (pair, m) in &broker.markets {
            info!(broker = %name, %pair, price = m.price, wallet = %m.wallet, "Paper market");
        }
    }
    for (id, t) in &config.traders {
        info!(
            trader = %id,
            broker = %t.broker,
            pair = %t.pair,
            enabled = t.enabled,
            "Trader configured"
        );
    }
}
