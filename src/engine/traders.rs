//! The live trader set.
//!
//! Traders are replaced as a whole generation: the caller builds a
//! `Generation` next to the running set and swaps it in with `commit_add`.
//! A cycle runs every live trader once on the worker pool and reports
//! completion through a callback fired by the last finishing trader.

use super::WorkerPool;
use crate::config::TraderConfig;
use crate::exchange::Brokers;
use crate::persistence::StateStore;
use crate::report::Reporter;
use crate::trader::{Trader, TraderEnv, TraderError, TraderSnapshot};
use crate::wallet::{ConflictMap, WalletDb};
use anyhow::Result;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

pub type SharedTrader = Arc<RwLock<Trader>>;

type DoneCallback = Box<dyn FnOnce(bool) + Send>;

/// Time spent per trader and per cycle.
#[derive(Debug, Clone, Default)]
pub struct Utilization {
    pub per_trader: BTreeMap<String, Duration>,
    pub last_cycle: Option<Duration>,
    pub cycles: u64,
}

/// Outcome of swapping in a generation.
#[derive(Debug, Clone, Default)]
pub struct CommitSummary {
    pub live: Vec<String>,
    pub removed: Vec<String>,
    /// Traders whose init failed; they retry on their next cycle.
    pub failed: Vec<(String, String)>,
}

/// Traders being prepared to replace the live set. Each generation has its
/// own wallet ledger and conflict registry.
pub struct Generation {
    traders: BTreeMap<String, Trader>,
    brokers: Brokers,
    wallet_db: Arc<WalletDb>,
    conflicts: Arc<ConflictMap>,
    store: Arc<StateStore>,
    reporter: Arc<dyn Reporter>,
    stop_flag: Arc<AtomicBool>,
}

impl Generation {
    /// Services for a trader on `broker` in this generation.
    pub fn env_for(&self, broker: &str) -> Result<TraderEnv, TraderError> {
        let exchange = self
            .brokers
            .get(broker)
            .cloned()
            .ok_or_else(|| TraderError::UnknownBroker(broker.to_string()))?;
        Ok(TraderEnv {
            broker: broker.to_string(),
            exchange,
            wallet_db: self.wallet_db.clone(),
            conflicts: self.conflicts.clone(),
            store: self.store.clone(),
            reporter: self.reporter.clone(),
            stop_flag: self.stop_flag.clone(),
        })
    }

    pub fn add_trader(&mut self, id: &str, config: TraderConfig) -> Result<()> {
        let env = self.env_for(&config.broker)?;
        self.insert(Trader::new(id, config, env));
        Ok(())
    }

    pub fn insert(&mut self, trader: Trader) {
        self.traders.insert(trader.id().to_string(), trader);
    }

    pub fn len(&self) -> usize {
        self.traders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traders.is_empty()
    }
}

/// Fires the completion callback once the last job is done.
struct Countdown {
    remaining: AtomicUsize,
    on_done: Mutex<Option<DoneCallback>>,
}

impl Countdown {
    fn new(jobs: usize, on_done: DoneCallback) -> Self {
        Self {
            remaining: AtomicUsize::new(jobs),
            on_done: Mutex::new(Some(on_done)),
        }
    }

    fn done(&self) -> Option<DoneCallback> {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return None;
        }
        self.on_done.lock().ok()?.take()
    }
}

pub struct Traders {
    brokers: Brokers,
    store: Arc<StateStore>,
    reporter: Arc<dyn Reporter>,
    live: RwLock<BTreeMap<String, SharedTrader>>,
    stop: Arc<AtomicBool>,
    utilization: Arc<Mutex<Utilization>>,
}

impl Traders {
    pub fn new(brokers: Brokers, store: Arc<StateStore>, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            brokers,
            store,
            reporter,
            live: RwLock::new(BTreeMap::new()),
            stop: Arc::new(AtomicBool::new(false)),
            utilization: Arc::new(Mutex::new(Utilization::default())),
        }
    }

    pub fn begin_add(&self) -> Generation {
        Generation {
            traders: BTreeMap::new(),
            brokers: self.brokers.clone(),
            wallet_db: Arc::new(WalletDb::new()),
            conflicts: Arc::new(ConflictMap::new()),
            store: self.store.clone(),
            reporter: self.reporter.clone(),
            stop_flag: self.stop.clone(),
        }
    }

    /// Replace the live set with `generation`.
    ///
    /// Old traders are locked one by one, which waits for any cycle they are
    /// running. Traders missing from the new generation cancel their orders
    /// and lose their saved state. New traders are initialized; a failed init
    /// is retried by the trader's next cycle.
    pub async fn commit_add(&self, generation: Generation) -> CommitSummary {
        let mut summary = CommitSummary::default();
        let mut live = self.live.write().await;

        for (id, trader) in std::mem::take(&mut *live) {
            let mut t = trader.write().await;
            if generation.traders.contains_key(&id) {
                continue;
            }
            if let Err(e) = t.shutdown().await {
                warn!(trader = %id, error = %e, "Failed to cancel orders of removed trader");
            }
            if let Err(e) = t.erase_state() {
                warn!(trader = %id, error = %e, "Failed to erase state of removed trader");
            }
            info!(trader = %id, "Trader removed");
            summary.removed.push(id);
        }

        self.reporter.clear();

        for (id, mut trader) in generation.traders {
            if let Err(e) = trader.init().await {
                let msg = format!("{:#}", e);
                warn!(trader = %id, error = %msg, "Trader init failed, retrying next cycle");
                summary.failed.push((id.clone(), msg));
            }
            summary.live.push(id.clone());
            live.insert(id, Arc::new(RwLock::new(trader)));
        }

        info!(
            traders = live.len(),
            removed = summary.removed.len(),
            failed = summary.failed.len(),
            "Trader generation committed"
        );
        summary
    }

    /// Start one cycle and return immediately. `on_done` receives `true`
    /// when the cycle finished without a stop request.
    pub async fn run_cycle<F>(&self, pool: &WorkerPool, on_done: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let traders: Vec<(String, SharedTrader)> = self
            .live
            .read()
            .await
            .iter()
            .map(|(id, t)| (id.clone(), t.clone()))
            .collect();
        let started = Instant::now();
        let timestamp = Utc::now();

        if traders.is_empty() {
            record_cycle(&self.utilization, started.elapsed());
            on_done(!self.stop.load(Ordering::SeqCst));
            return;
        }

        debug!(traders = traders.len(), workers = pool.size(), "Cycle started");
        let countdown = Arc::new(Countdown::new(traders.len(), Box::new(on_done)));

        for (id, trader) in traders {
            let stop = self.stop.clone();
            let utilization = self.utilization.clone();
            let countdown = countdown.clone();

            pool.spawn(async move {
                let begin = Instant::now();
                {
                    let mut t = trader.write().await;
                    if let Err(e) = t.exchange().reset(timestamp).await {
                        warn!(trader = %id, error = %e, "Broker reset failed");
                    }
                    if !stop.load(Ordering::SeqCst) {
                        t.run().await;
                    }
                }
                record_trader(&utilization, &id, begin.elapsed());

                if let Some(on_done) = countdown.done() {
                    record_cycle(&utilization, started.elapsed());
                    on_done(!stop.load(Ordering::SeqCst));
                }
            });
        }
    }

    /// Run one cycle to completion.
    pub async fn cycle(&self, pool: &WorkerPool) -> bool {
        let (tx, rx) = oneshot::channel();
        self.run_cycle(pool, move |ok| {
            let _ = tx.send(ok);
        })
        .await;
        rx.await.unwrap_or(false)
    }

    /// Ask running and queued traders to stop placing orders.
    pub fn stop_cycle(&self) {
        info!("Stop requested");
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> Vec<TraderSnapshot> {
        let traders: Vec<SharedTrader> = self.live.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(traders.len());
        for t in traders {
            out.push(t.read().await.snapshot());
        }
        out
    }

    pub async fn get(&self, id: &str) -> Option<SharedTrader> {
        self.live.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.live.read().await.len()
    }

    /// Cancel every trader's orders, keeping saved state.
    pub async fn shutdown_all(&self) {
        let traders: Vec<SharedTrader> = self.live.read().await.values().cloned().collect();
        let jobs = traders.into_iter().map(|t| async move {
            let mut t = t.write().await;
            if let Err(e) = t.shutdown().await {
                warn!(trader = %t.id(), error = %e, "Shutdown failed");
            }
        });
        futures_util::future::join_all(jobs).await;
    }

    pub fn utilization(&self) -> Utilization {
        self.utilization
            .lock()
            .map(|u| u.clone())
            .unwrap_or_default()
    }
}

fn record_trader(utilization: &Mutex<Utilization>, id: &str, elapsed: Duration) {
    if let Ok(mut u) = utilization.lock() {
        u.per_trader.insert(id.to_string(), elapsed);
    }
}

fn record_cycle(utilization: &Mutex<Utilization>, elapsed: Duration) {
    if let Ok(mut u) = utilization.lock() {
        u.last_cycle = Some(elapsed);
        u.cycles += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{
        Exchange, FeeScheme, MarketInfo, NewOrder, Order, PaperExchange, PlaceResult, Ticker,
        TradeSync,
    };
    use crate::report::MemoryReporter;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::collections::HashMap;
    use tokio::sync::Notify;

    /// Paper broker whose first open-orders query waits for `release`.
    struct Gated {
        inner: Arc<PaperExchange>,
        armed: AtomicBool,
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Exchange for Gated {
        async fn get_ticker(&self, pair: &str) -> anyhow::Result<Ticker> {
            self.inner.get_ticker(pair).await
        }

        async fn get_balance(&self, symbol: &str, pair: &str) -> anyhow::Result<f64> {
            self.inner.get_balance(symbol, pair).await
        }

        async fn get_open_orders(&self, pair: &str) -> anyhow::Result<Vec<Order>> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.get_open_orders(pair).await
        }

        async fn batch_place_order(&self, orders: &[NewOrder]) -> anyhow::Result<Vec<PlaceResult>> {
            self.inner.batch_place_order(orders).await
        }

        async fn sync_trades(&self, cursor: Option<String>, pair: &str) -> anyhow::Result<TradeSync> {
            self.inner.sync_trades(cursor, pair).await
        }

        async fn reset(&self, timestamp: DateTime<Utc>) -> anyhow::Result<()> {
            self.inner.reset(timestamp).await
        }

        async fn get_market_info(&self, pair: &str) -> anyhow::Result<MarketInfo> {
            self.inner.get_market_info(pair).await
        }
    }

    fn market(asset: &str, wallet: &str) -> MarketInfo {
        MarketInfo {
            asset_symbol: asset.to_string(),
            currency_symbol: "USD".to_string(),
            asset_step: 0.01,
            currency_step: 0.01,
            min_size: 0.01,
            min_volume: 0.0,
            fees: 0.0,
            fee_scheme: FeeScheme::Currency,
            leverage: 0.0,
            invert_price: false,
            wallet_id: wallet.to_string(),
        }
    }

    async fn setup() -> (Arc<PaperExchange>, Traders) {
        let ex = Arc::new(PaperExchange::new());
        ex.add_market("BTCUSD", market("BTC", "a"), 99.0, 101.0).await;
        ex.add_market("ETHUSD", market("ETH", "b"), 99.0, 101.0).await;
        ex.set_balance("a", "USD", 10_000.0).await;
        ex.set_balance("b", "USD", 10_000.0).await;

        let mut brokers: Brokers = HashMap::new();
        brokers.insert("paper".to_string(), ex.clone());
        let traders = Traders::new(
            brokers,
            Arc::new(StateStore::in_memory().unwrap()),
            Arc::new(MemoryReporter::new()),
        );
        (ex, traders)
    }

    async fn commit(traders: &Traders, pairs: &[(&str, &str)]) -> CommitSummary {
        let mut generation = traders.begin_add();
        for (id, pair) in pairs {
            generation
                .add_trader(id, TraderConfig::new("paper", pair))
                .unwrap();
        }
        traders.commit_add(generation).await
    }

    #[tokio::test]
    async fn test_cycle_runs_every_trader_once() {
        let (ex, traders) = setup().await;
        let summary = commit(&traders, &[("btc", "BTCUSD"), ("eth", "ETHUSD")]).await;
        assert!(summary.failed.is_empty());

        let pool = WorkerPool::new(2);
        assert!(traders.cycle(&pool).await);

        // both traders share one reset timestamp
        assert_eq!(ex.stats().await.resets, 1);
        assert_eq!(ex.get_open_orders("BTCUSD").await.unwrap().len(), 1);
        assert_eq!(ex.get_open_orders("ETHUSD").await.unwrap().len(), 1);

        let status = traders.status().await;
        assert_eq!(status.len(), 2);
        assert!(status.iter().all(|s| s.initialized && s.errors.generic.is_none()));

        let util = traders.utilization();
        assert_eq!(util.cycles, 1);
        assert_eq!(util.per_trader.len(), 2);
    }

    #[tokio::test]
    async fn test_stop_flag_blocks_every_trader() {
        let (ex, traders) = setup().await;
        commit(&traders, &[("btc", "BTCUSD"), ("eth", "ETHUSD")]).await;
        let pool = WorkerPool::new(1);

        traders.stop_cycle();
        assert!(!traders.cycle(&pool).await);
        assert_eq!(ex.stats().await.batch_calls, 0);

        traders.resume();
        assert!(traders.cycle(&pool).await);
        assert_eq!(ex.stats().await.batch_calls, 2);
    }

    #[tokio::test]
    async fn test_commit_removes_missing_traders() {
        let (ex, traders) = setup().await;
        commit(&traders, &[("btc", "BTCUSD"), ("eth", "ETHUSD")]).await;
        let pool = WorkerPool::new(2);
        traders.cycle(&pool).await;

        let summary = commit(&traders, &[("btc", "BTCUSD")]).await;
        assert_eq!(summary.removed, vec!["eth".to_string()]);
        assert_eq!(summary.live, vec!["btc".to_string()]);
        assert!(ex.get_open_orders("ETHUSD").await.unwrap().is_empty());
        assert_eq!(ex.get_open_orders("BTCUSD").await.unwrap().len(), 1);
        assert!(traders.store.load("eth").unwrap().is_none());
        assert_eq!(traders.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_init_is_retried_by_cycle() {
        let (ex, traders) = setup().await;
        let summary = commit(&traders, &[("xrp", "XRPUSD")]).await;
        assert_eq!(summary.failed.len(), 1);

        ex.add_market("XRPUSD", market("XRP", "c"), 0.99, 1.01).await;
        ex.set_balance("c", "USD", 100.0).await;
        let pool = WorkerPool::new(1);
        traders.cycle(&pool).await;

        let t = traders.get("xrp").await.unwrap();
        assert!(t.read().await.is_initialized());
    }

    #[tokio::test]
    async fn test_unknown_broker_is_rejected() {
        let (_ex, traders) = setup().await;
        let mut generation = traders.begin_add();
        let err = generation
            .add_trader("x", TraderConfig::new("nope", "BTCUSD"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TraderError>(),
            Some(TraderError::UnknownBroker(_))
        ));
        assert!(generation.is_empty());
    }

    #[tokio::test]
    async fn test_empty_set_completes() {
        let (_ex, traders) = setup().await;
        assert!(traders.cycle(&WorkerPool::new(1)).await);
    }

    #[tokio::test]
    async fn test_get_returns_shared_handle() {
        let (_ex, traders) = setup().await;
        commit(&traders, &[("btc", "BTCUSD")]).await;
        assert!(traders.get("eth").await.is_none());

        let t = traders.get("btc").await.unwrap();
        let guard = t.read().await;
        assert_eq!(guard.id(), "btc");
        assert!(guard.is_initialized());
    }

    #[tokio::test]
    async fn test_stop_during_cycle_skips_placement() {
        let (ex, _) = setup().await;
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let gated = Arc::new(Gated {
            inner: ex.clone(),
            armed: AtomicBool::new(true),
            entered: entered.clone(),
            release: release.clone(),
        });
        let mut brokers: Brokers = HashMap::new();
        brokers.insert("paper".to_string(), gated);
        let traders = Traders::new(
            brokers,
            Arc::new(StateStore::in_memory().unwrap()),
            Arc::new(MemoryReporter::new()),
        );
        commit(&traders, &[("btc", "BTCUSD")]).await;

        let (tx, rx) = oneshot::channel();
        traders
            .run_cycle(&WorkerPool::new(1), move |ok| {
                let _ = tx.send(ok);
            })
            .await;

        // the trader is between strategy run and placement
        entered.notified().await;
        traders.stop_cycle();
        release.notify_one();

        assert!(!rx.await.unwrap());
        assert_eq!(ex.stats().await.batch_calls, 0);
        assert!(ex.get_open_orders("BTCUSD").await.unwrap().is_empty());
    }
}
