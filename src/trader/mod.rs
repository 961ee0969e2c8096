//! A single market-making trader.
//!
//! Each cycle the trader syncs fills, decides whether they commit, builds a
//! `MarketState`, lets the strategy (or the achieve-mode driver) request
//! orders through `Control`, reconciles them with the broker, and persists
//! its state document.

mod control;
mod error;
mod planner;
mod state;

pub use control::{Control, ControlOutcome, OrderLimits};
pub use error::TraderError;
pub use planner::{is_same_order, plan_orders, OrderPlan, PlanInput};
pub use state::{AchieveMode, TradeRecord, TraderState};

use crate::config::{ResetConfig, TraderConfig};
use crate::exchange::{Exchange, MarketInfo, NewOrder, Order, Ticker, Trade, TradeSync};
use crate::persistence::StateStore;
use crate::report::{MiscReport, Reporter, SafeRange, TraderErrors};
use crate::strategy::{create_spread_generator, create_strategy, SpreadGenerator, Strategy};
use crate::trading::{Acb, MarketEvent, MarketState, OrderError, Side};
use crate::wallet::{ConflictKey, ConflictMap, WalletDb, WalletKey};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Services shared by all traders of one generation.
#[derive(Clone)]
pub struct TraderEnv {
    pub broker: String,
    pub exchange: Arc<dyn Exchange>,
    pub wallet_db: Arc<WalletDb>,
    pub conflicts: Arc<ConflictMap>,
    pub store: Arc<StateStore>,
    pub reporter: Arc<dyn Reporter>,
    pub stop_flag: Arc<AtomicBool>,
}

/// Read-only status of a trader.
#[derive(Debug, Clone, Serialize)]
pub struct TraderSnapshot {
    pub id: String,
    pub broker: String,
    pub pair: String,
    pub enabled: bool,
    pub initialized: bool,
    pub stopped: bool,
    pub position: f64,
    pub unconfirmed_position: f64,
    pub last_price: Option<f64>,
    pub equilibrium: Option<f64>,
    pub trades: usize,
    pub achieve: bool,
    pub last_event: MarketEvent,
    pub errors: TraderErrors,
}

struct Balances {
    live_assets: f64,
    live_currency: f64,
    allocated_assets: f64,
    allocated_currency: f64,
}

/// Client order tag identifying this trader's orders on the broker.
pub fn magic_tag(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    format!("mm{}", hex::encode(&digest[..4]))
}

fn new_uid(id: &str) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(Utc::now().timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    let d = hasher.finalize();
    u32::from_le_bytes([d[0], d[1], d[2], d[3]]).max(1)
}

pub struct Trader {
    id: String,
    config: TraderConfig,
    env: TraderEnv,
    magic: String,
    strategy: Box<dyn Strategy>,
    spread: Box<dyn SpreadGenerator>,
    state: TraderState,
    market: Option<MarketInfo>,
    conflict_key: Option<ConflictKey>,
    first_cycle: bool,
    last_event: MarketEvent,
    last_price: Option<f64>,
    safe_range: SafeRange,
    custom: BTreeMap<String, serde_json::Value>,
    errors: TraderErrors,
}

impl Trader {
    pub fn new(id: &str, config: TraderConfig, env: TraderEnv) -> Self {
        let strategy = create_strategy(&config.strategy);
        let spread = create_spread_generator(&config.spread);
        Self::with_components(id, config, env, strategy, spread)
    }

    pub fn with_components(
        id: &str,
        config: TraderConfig,
        env: TraderEnv,
        strategy: Box<dyn Strategy>,
        spread: Box<dyn SpreadGenerator>,
    ) -> Self {
        Self {
            id: id.to_string(),
            magic: magic_tag(id),
            config,
            env,
            strategy,
            spread,
            state: TraderState::default(),
            market: None,
            conflict_key: None,
            first_cycle: true,
            last_event: MarketEvent::Idle,
            last_price: None,
            safe_range: SafeRange::default(),
            custom: BTreeMap::new(),
            errors: TraderErrors::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &TraderConfig {
        &self.config
    }

    pub fn exchange(&self) -> &Arc<dyn Exchange> {
        &self.env.exchange
    }

    pub fn state(&self) -> &TraderState {
        &self.state
    }

    pub fn magic(&self) -> &str {
        &self.magic
    }

    pub fn is_initialized(&self) -> bool {
        self.market.is_some()
    }

    /// Fetch market rules, claim the pair and load the saved state.
    pub async fn init(&mut self) -> Result<()> {
        let market = self
            .env
            .exchange
            .get_market_info(&self.config.pair)
            .await
            .with_context(|| format!("Failed to get market info for {}", self.config.pair))?;

        if self.config.enabled && !self.config.dont_allocate {
            let key = ConflictKey::new(&self.env.broker, &market.wallet_id, &self.config.pair);
            self.env
                .conflicts
                .register(key.clone(), &self.id)
                .map_err(TraderError::from)?;
            self.conflict_key = Some(key);
        }

        self.state = match self.env.store.load(&self.id) {
            Ok(Some(saved)) => self.restore(saved, &market),
            Ok(None) => TraderState::fresh(new_uid(&self.id), market.invert_price),
            Err(e) if matches!(e.downcast_ref::<TraderError>(), Some(TraderError::CorruptState { .. })) => {
                warn!(trader = %self.id, error = %e, "Discarding corrupt state");
                TraderState::fresh(new_uid(&self.id), market.invert_price)
            }
            Err(e) => return Err(e.context("Failed to load trader state")),
        };

        info!(
            trader = %self.id,
            broker = %self.env.broker,
            pair = %self.config.pair,
            strategy = self.strategy.name(),
            position = self.state.position,
            "Trader initialized"
        );
        self.market = Some(market);
        self.first_cycle = true;
        Ok(())
    }

    fn restore(&mut self, saved: TraderState, market: &MarketInfo) -> TraderState {
        let strategy = self.strategy.load(&saved.strategy);
        let spread = self.spread.load(&saved.spread);
        match (strategy, spread) {
            (Ok(strategy), Ok(spread)) => {
                self.strategy = strategy;
                self.spread = spread;
                saved
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(trader = %self.id, error = %e, "Saved strategy state unusable, starting fresh");
                TraderState::fresh(new_uid(&self.id), market.invert_price)
            }
        }
    }

    /// Run one cycle. Failures become the trader's generic error and are
    /// retried on the next cycle.
    pub async fn run(&mut self) {
        if let Err(e) = self.cycle().await {
            let msg = format!("{:#}", e);
            error!(trader = %self.id, error = %msg, "Trader cycle failed");
            self.errors.generic = Some(msg);
            self.env.reporter.report_errors(&self.id, &self.errors);
        }
    }

    async fn cycle(&mut self) -> Result<()> {
        if self.market.is_none() {
            self.init().await?;
        }
        let market = self
            .market
            .clone()
            .ok_or_else(|| TraderError::NotInitialized(self.id.clone()))?;
        let pair = self.config.pair.clone();
        let exchange = self.env.exchange.clone();
        self.errors = TraderErrors::default();

        let ticker = exchange
            .get_ticker(&pair)
            .await
            .context("Failed to fetch ticker")?;
        if !ticker.is_valid() {
            return Err(TraderError::InvalidTicker {
                pair,
                bid: ticker.bid,
                ask: ticker.ask,
            }
            .into());
        }
        self.last_price = Some(ticker.last);

        let sync = exchange
            .sync_trades(self.state.trade_lastid.clone(), &pair)
            .await
            .context("Failed to sync trades")?;
        self.absorb_trades(sync);

        let (event, event_price) = self.detect_event(&ticker, &market);
        let balances = self.fetch_balances(&market).await?;
        let mut mstate = self.market_state(&ticker, &market, &balances, event, event_price);
        self.check_lost_trades(&mstate, &market);

        if self.state.need_initial_reset || self.pending_reset().is_some() {
            if let Err(e) = self.apply_reset(&mstate) {
                warn!(trader = %self.id, error = %e, "Reset rejected");
                self.errors.generic = Some(e.to_string());
                self.cancel_own_orders(&pair).await?;
                return self.finish_cycle(&mstate, &market, Vec::new());
            }
            mstate = self.market_state(&ticker, &market, &balances, event, event_price);
        }

        if self.state.stopped || !self.config.enabled {
            let why = if self.state.stopped { "stopped" } else { "disabled" };
            self.errors.generic = Some(why.to_string());
            self.cancel_own_orders(&pair).await?;
            return self.finish_cycle(&mstate, &market, Vec::new());
        }

        let limits = OrderLimits::from(&self.config);
        let mut ctl = Control::new(&mstate, &market, &limits);
        let mut achieved = false;
        match self.state.achieve {
            Some(achieve) => achieved = drive_achieve(&mut ctl, achieve),
            None => {
                let next = self.strategy.run(&mut ctl).context("Strategy failed")?;
                self.strategy = next;
            }
        }
        let outcome = ctl.finish();
        self.absorb_outcome(&outcome);
        if achieved {
            self.finish_achieve(&mstate);
        }
        self.spread = self.spread.add_point(ticker.last);

        let open = exchange
            .get_open_orders(&pair)
            .await
            .context("Failed to fetch open orders")?;
        let own: Vec<Order> = open
            .into_iter()
            .filter(|o| o.client_id.as_deref() == Some(self.magic.as_str()))
            .collect();

        let plan = plan_orders(&PlanInput {
            pair: &pair,
            magic: &self.magic,
            market: &market,
            own_orders: &own,
            buy: outcome.buy,
            sell: outcome.sell,
            market_order: outcome.market_order,
            unconfirmed: self.state.unconfirmed_position.position(),
        });
        self.state.target_buy = plan.target_buy;
        self.state.target_sell = plan.target_sell;

        let reported = self.execute_plan(&plan).await?;
        self.finish_cycle(&mstate, &market, reported)
    }

    fn absorb_trades(&mut self, sync: TradeSync) {
        let mut trades = sync.trades;
        trades.sort_by_key(|t| t.time);
        for trade in trades {
            if self.state.trades.iter().any(|r| r.trade.id == trade.id) {
                continue;
            }
            info!(
                trader = %self.id,
                id = %trade.id,
                price = trade.price,
                size = trade.size,
                "Fill"
            );
            self.state.unconfirmed_position = self
                .state
                .unconfirmed_position
                .execution(trade.eff_price, trade.eff_size);
            self.state.spent_currency += trade.eff_size * trade.eff_price;
            self.spread = self.spread.report_trade(trade.price, trade.size);
            self.state.push_trade(trade, false);
        }
        if sync.cursor.is_some() {
            self.state.trade_lastid = sync.cursor;
        }
    }

    fn detect_event(&mut self, ticker: &Ticker, market: &MarketInfo) -> (MarketEvent, f64) {
        let filled = self.state.unconfirmed_position.position();
        let eps = market.asset_step * 0.5;
        let reached =
            |target: Option<f64>, filled: f64| filled > 0.0 && target.is_some_and(|t| filled >= t - eps);

        if reached(self.state.target_buy, filled) || reached(self.state.target_sell, -filled) {
            let price = self
                .state
                .unconfirmed_position
                .open_price()
                .unwrap_or(ticker.last);
            self.commit(filled, price);
            return (MarketEvent::Trade, price);
        }
        if self.first_cycle {
            return (MarketEvent::Start, ticker.last);
        }
        if let Some(p) = self.state.alert_buy.filter(|p| ticker.ask <= *p) {
            self.state.alert_buy = None;
            return (MarketEvent::Alert, p);
        }
        if let Some(p) = self.state.alert_sell.filter(|p| ticker.bid >= *p) {
            self.state.alert_sell = None;
            return (MarketEvent::Alert, p);
        }
        (MarketEvent::Idle, ticker.last)
    }

    /// Move the uncommitted fills into the committed position.
    fn commit(&mut self, size: f64, price: f64) {
        let st = &mut self.state;
        st.position += size;
        st.completed_trades = st.trades.len();
        st.last_trade_price = price;
        st.last_trade_size = size;
        if let (Some(budget), Some(equity)) = (st.budget, st.equity_allocation) {
            st.last_trade_eq_extra = Some(budget - equity);
        }
        st.unconfirmed_position = Acb::empty(st.acb.is_inverted());
        st.target_buy = None;
        st.target_sell = None;
        info!(trader = %self.id, size, price, position = st.position, "Trade committed");
    }

    fn wallet_key(&self, market: &MarketInfo, symbol: &str) -> WalletKey {
        WalletKey::new(&self.env.broker, &market.wallet_id, symbol, self.state.uid)
    }

    async fn fetch_balances(&self, market: &MarketInfo) -> Result<Balances> {
        let ex = &self.env.exchange;
        let pair = &self.config.pair;
        let live_assets = ex
            .get_balance(&market.asset_symbol, pair)
            .await
            .context("Failed to fetch asset balance")?
            - self.config.external_assets;
        let live_currency = ex
            .get_balance(&market.currency_symbol, pair)
            .await
            .context("Failed to fetch currency balance")?
            - self.config.external_currency;

        let currency_claims = self
            .env
            .wallet_db
            .query(&self.wallet_key(market, &market.currency_symbol));
        let allocated_assets = if market.is_leveraged() {
            live_assets
        } else {
            let claims = self
                .env
                .wallet_db
                .query(&self.wallet_key(market, &market.asset_symbol));
            live_assets - claims.other_traders
        };

        Ok(Balances {
            live_assets,
            live_currency,
            allocated_assets,
            allocated_currency: (live_currency - currency_claims.other_traders).max(0.0),
        })
    }

    fn market_state(
        &self,
        ticker: &Ticker,
        market: &MarketInfo,
        b: &Balances,
        event: MarketEvent,
        event_price: f64,
    ) -> MarketState {
        let price = ticker.last;
        let leveraged = market.is_leveraged();
        let inverted = market.invert_price;
        let position = self.state.position;
        let unconfirmed = self.state.unconfirmed_position.position();

        let balance = match self.state.budget {
            Some(budget) if leveraged => budget.min(b.allocated_currency),
            Some(budget) => (budget - self.state.spent_currency).min(b.allocated_currency),
            None => b.allocated_currency,
        };
        let equity = MarketState::compute_equity(leveraged, inverted, balance, position + unconfirmed, price);
        let notional = if inverted {
            position.abs() / price
        } else {
            position.abs() * price
        };
        let leverage = if equity > 0.0 { notional / equity } else { 0.0 };

        let step = market.currency_step;
        let highest_buy_price = (ticker.ask - step).max(ticker.bid);
        let lowest_sell_price = (ticker.bid + step).min(ticker.ask);

        let equilibrium = self.state.equilibrium.unwrap_or(price);
        let dynmult = self.config.spread.use_dynmult;
        let sug_buy_price = self
            .spread
            .order_price(Side::Buy, equilibrium, dynmult)
            .map(|p| p / (1.0 + market.fees))
            .unwrap_or(highest_buy_price)
            .min(highest_buy_price);
        let sug_sell_price = self
            .spread
            .order_price(Side::Sell, equilibrium, dynmult)
            .map(|p| p / (1.0 - market.fees))
            .unwrap_or(lowest_sell_price)
            .max(lowest_sell_price);

        MarketState {
            event,
            cur_price: price,
            cur_time: ticker.time,
            event_price,
            event_time: ticker.time,
            position,
            unconfirmed_position: unconfirmed,
            balance,
            equity,
            leverage,
            highest_buy_price,
            lowest_sell_price,
            sug_buy_price,
            sug_sell_price,
            last_trade_price: self.state.last_trade_price,
            last_trade_size: self.state.last_trade_size,
            live_assets: b.live_assets,
            live_currency: b.live_currency,
            allocated_assets: b.allocated_assets,
            allocated_currency: b.allocated_currency,
            open_price: self.state.acb.open_price(),
            rpnl: self.state.acb.rpnl(),
            upnl: self.state.acb.upnl(price),
            spent_currency: self.state.spent_currency,
            leveraged,
            inverted,
        }
    }

    /// Compare the broker's balance with what the trader tracks. A mismatch
    /// lasting `lost_trade_cycles` cycles is reported.
    fn check_lost_trades(&mut self, mstate: &MarketState, market: &MarketInfo) {
        if self.state.need_initial_reset {
            self.state.lost_trade_cycles = 0;
            return;
        }
        let tracked = self.state.position + self.state.unconfirmed_position.position();
        let live = mstate.allocated_assets;
        if (live - tracked).abs() <= market.min_order_size(mstate.cur_price) {
            self.state.lost_trade_cycles = 0;
            return;
        }
        self.state.lost_trade_cycles += 1;
        debug!(trader = %self.id, live, tracked, cycles = self.state.lost_trade_cycles, "Position mismatch");
        if self.state.lost_trade_cycles >= self.config.lost_trade_cycles {
            warn!(trader = %self.id, live, tracked, "Lost trade detected");
            self.errors.generic = Some(format!(
                "lost trade detected: broker shows {} but {} is tracked",
                live, tracked
            ));
        }
    }

    fn pending_reset(&self) -> Option<&ResetConfig> {
        self.config
            .reset
            .as_ref()
            .filter(|r| r.revision > self.state.reset_rev)
    }

    /// Apply the first-start reset and/or a new reset revision. Nothing
    /// changes when the strategy rejects the post-reset state.
    fn apply_reset(&mut self, mstate: &MarketState) -> Result<(), TraderError> {
        let request = self.pending_reset().cloned();
        let price = mstate.cur_price;

        let mut post = mstate.clone();
        let mut new_position = if self.state.need_initial_reset {
            mstate.allocated_assets
        } else {
            self.state.position + self.state.unconfirmed_position.position()
        };
        let mut achieve = None;
        if let Some(req) = &request {
            if let Some(budget) = req.balance {
                post.balance = budget.min(mstate.allocated_currency);
            }
            match (req.achieve, req.position) {
                (true, target) => {
                    let target = target.unwrap_or_else(|| self.strategy.calc_initial_position(mstate));
                    achieve = Some(AchieveMode {
                        target_position: target,
                        available_balance: post.balance,
                    });
                }
                (false, Some(p)) => new_position = p,
                (false, None) => {}
            }
        }
        post.position = new_position;
        post.unconfirmed_position = 0.0;
        post.equity = MarketState::compute_equity(post.leveraged, post.inverted, post.balance, new_position, price);

        let strategy = match achieve {
            Some(_) => None,
            None => Some(
                self.strategy
                    .reset(&post)
                    .map_err(|e| TraderError::ResetRejected(format!("{:#}", e)))?,
            ),
        };

        let size = new_position - self.state.acb.position();
        if size.abs() > 1e-12 {
            let id = match &request {
                Some(req) => format!("reset-{}", req.revision),
                None => "reset-initial".to_string(),
            };
            self.state.push_trade(
                Trade {
                    id,
                    time: Utc::now(),
                    price,
                    size,
                    eff_price: price,
                    eff_size: size,
                },
                true,
            );
        }

        let st = &mut self.state;
        st.position = new_position;
        st.unconfirmed_position = Acb::empty(st.acb.is_inverted());
        st.completed_trades = st.trades.len();
        st.target_buy = None;
        st.target_sell = None;
        st.achieve = achieve;
        st.equilibrium = Some(price);
        st.need_initial_reset = false;
        st.lost_trade_cycles = 0;
        if let Some(req) = &request {
            st.reset_rev = req.revision;
            st.stopped = false;
            if let Some(budget) = req.balance {
                st.budget = Some(budget);
                st.spent_currency = 0.0;
            }
        }
        if let Some(strategy) = strategy {
            self.strategy = strategy;
        }

        info!(
            trader = %self.id,
            position = new_position,
            achieve = achieve.is_some(),
            revision = self.state.reset_rev,
            "Trader reset"
        );
        Ok(())
    }

    fn finish_achieve(&mut self, mstate: &MarketState) {
        let mut post = mstate.clone();
        post.position = mstate.position + mstate.unconfirmed_position;
        post.unconfirmed_position = 0.0;

        match self.strategy.reset(&post) {
            Ok(strategy) => {
                let filled = self.state.unconfirmed_position.position();
                if filled != 0.0 {
                    let price = self
                        .state
                        .unconfirmed_position
                        .open_price()
                        .unwrap_or(mstate.cur_price);
                    self.commit(filled, price);
                }
                self.strategy = strategy;
                self.state.achieve = None;
                info!(trader = %self.id, position = self.state.position, "Target position achieved");
            }
            Err(e) => {
                self.errors.generic = Some(TraderError::ResetRejected(format!("{:#}", e)).to_string());
            }
        }
    }

    fn absorb_outcome(&mut self, out: &ControlOutcome) {
        if out.equilibrium.is_some() {
            self.state.equilibrium = out.equilibrium;
        }
        if out.neutral_price.is_some() {
            self.state.neutral_price = out.neutral_price;
        }
        if out.equity_allocation.is_some() {
            self.state.equity_allocation = out.equity_allocation;
        }
        if let Some(range) = out.safe_range {
            self.safe_range = range;
        }
        self.custom = out.reports.clone();
        self.state.alert_buy = out.alert_buy;
        self.state.alert_sell = out.alert_sell;
        self.errors.buy = out.buy_error.as_ref().map(OrderError::to_string);
        self.errors.sell = out.sell_error.as_ref().map(OrderError::to_string);

        if let Some((new_position, price)) = out.alter_position {
            self.alter_position(new_position, price);
        }
    }

    fn alter_position(&mut self, new_position: f64, price: f64) {
        let size = new_position - self.state.position;
        if size == 0.0 {
            return;
        }
        let id = format!("alter-{}", self.state.trades.len());
        self.state.push_trade(
            Trade {
                id,
                time: Utc::now(),
                price,
                size,
                eff_price: price,
                eff_size: size,
            },
            true,
        );
        self.state.position = new_position;
        self.state.completed_trades = self.state.trades.len();
        info!(trader = %self.id, position = new_position, price, "Position altered by strategy");
    }

    /// Send the plan unless a stop was requested. Returns the orders that
    /// rest on the broker afterwards.
    async fn execute_plan(&mut self, plan: &OrderPlan) -> Result<Vec<Order>> {
        let mut resting = plan.kept.clone();
        if plan.entries.is_empty() {
            return Ok(resting);
        }
        if self.env.stop_flag.load(Ordering::SeqCst) {
            warn!(trader = %self.id, "Stop requested, order placement skipped");
            return Ok(resting);
        }

        let results = self
            .env
            .exchange
            .batch_place_order(&plan.orders())
            .await
            .context("Failed to place orders")?;

        if results.len() != plan.entries.len() {
            let msg = format!(
                "broker returned {} results for {} orders",
                results.len(),
                plan.entries.len()
            );
            error!(trader = %self.id, "{}", msg);
            self.errors.generic = Some(msg);
        }

        for ((side, req), res) in plan.entries.iter().zip(results) {
            if let Some(err) = res.error {
                let e = OrderError::placement(req.price.unwrap_or(0.0), req.size.abs(), err);
                warn!(trader = %self.id, %side, error = %e, "Order placement failed");
                match side {
                    Side::Buy => self.errors.buy = Some(e.to_string()),
                    Side::Sell => self.errors.sell = Some(e.to_string()),
                }
                continue;
            }
            if let (Some(id), Some(price)) = (res.order_id, req.price) {
                if !req.is_cancel() {
                    debug!(trader = %self.id, %side, %id, price, size = req.size, "Order placed");
                    resting.push(Order {
                        id,
                        client_id: req.client_id.clone(),
                        size: req.size,
                        price,
                    });
                }
            }
        }
        Ok(resting)
    }

    async fn cancel_own_orders(&self, pair: &str) -> Result<()> {
        if self.env.stop_flag.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel_orders_now(pair).await
    }

    async fn cancel_orders_now(&self, pair: &str) -> Result<()> {
        let open = self
            .env
            .exchange
            .get_open_orders(pair)
            .await
            .context("Failed to fetch open orders")?;
        let cancels: Vec<NewOrder> = open
            .iter()
            .filter(|o| o.client_id.as_deref() == Some(self.magic.as_str()))
            .map(|o| NewOrder::cancel(pair, o))
            .collect();
        if cancels.is_empty() {
            return Ok(());
        }

        let results = self
            .env
            .exchange
            .batch_place_order(&cancels)
            .await
            .context("Failed to cancel orders")?;
        for res in results {
            if let Some(err) = res.error {
                warn!(trader = %self.id, error = %err, "Cancel failed");
            }
        }
        Ok(())
    }

    /// Claim this cycle's balances in the wallet ledger.
    fn allocate(&self, mstate: &MarketState, market: &MarketInfo) {
        let (currency, assets) = if self.config.dont_allocate {
            (0.0, 0.0)
        } else {
            let currency = match self.state.equity_allocation {
                Some(equity) => equity.min(mstate.allocated_currency).max(0.0),
                None => mstate.balance,
            };
            (currency, (mstate.position + mstate.unconfirmed_position).max(0.0))
        };
        let db = &self.env.wallet_db;
        db.alloc(self.wallet_key(market, &market.currency_symbol), currency);
        if !market.is_leveraged() {
            db.alloc(self.wallet_key(market, &market.asset_symbol), assets);
        }
    }

    fn finish_cycle(&mut self, mstate: &MarketState, market: &MarketInfo, orders: Vec<Order>) -> Result<()> {
        self.allocate(mstate, market);
        self.state.last_known_live_position = mstate.live_assets;
        self.state.last_known_live_balance = mstate.live_currency;
        self.state.strategy = self.strategy.save();
        self.state.spread = self.spread.save();
        self.env
            .store
            .save(&self.id, &self.state)
            .context("Failed to persist trader state")?;

        self.first_cycle = false;
        self.last_event = mstate.event;

        let r = &self.env.reporter;
        r.report_price(&self.id, mstate.cur_price);
        r.report_orders(&self.id, &orders);
        r.report_trades(&self.id, &self.state.trades);
        r.report_misc(&self.id, &self.misc_report(mstate));
        r.report_errors(&self.id, &self.errors);
        Ok(())
    }

    fn misc_report(&self, mstate: &MarketState) -> MiscReport {
        let (dynmult_buy, dynmult_sell) = self.spread.dyn_mult();
        let trade_dir = match Side::of_size(self.state.last_trade_size) {
            Some(Side::Buy) => 1,
            Some(Side::Sell) => -1,
            None => 0,
        };
        MiscReport {
            event: mstate.event,
            trade_dir,
            achieve: self.state.achieve.is_some(),
            enabled: self.config.enabled && !self.state.stopped,
            equilibrium: self.state.equilibrium,
            spread: self.spread.base_spread(),
            dynmult_buy,
            dynmult_sell,
            safe_range: self.safe_range,
            budget_allocated: self.state.equity_allocation.unwrap_or(mstate.equity),
            position: self.state.position,
            open_price: self.state.acb.open_price(),
            rpnl: self.state.acb.rpnl(),
            upnl: self.state.acb.upnl(mstate.cur_price),
            accumulated_profit: self.state.accumulated_profit(),
            custom: self.custom.clone(),
        }
    }

    /// Stop trading: cancel own orders and stay idle until a new reset
    /// revision is applied.
    pub async fn stop(&mut self) -> Result<()> {
        self.state.stopped = true;
        if self.market.is_some() {
            self.cancel_orders_now(&self.config.pair).await?;
            self.env
                .store
                .save(&self.id, &self.state)
                .context("Failed to persist trader state")?;
        }
        info!(trader = %self.id, "Trader stopped");
        Ok(())
    }

    /// Cancel own orders and give up the pair, keeping the saved state.
    pub async fn shutdown(&mut self) -> Result<()> {
        let result = match self.market {
            Some(_) => self.cancel_orders_now(&self.config.pair).await,
            None => Ok(()),
        };
        if let Some(key) = self.conflict_key.take() {
            self.env.conflicts.release(&key, &self.id);
        }
        debug!(trader = %self.id, "Trader shut down");
        result
    }

    /// Delete the saved state and the trader's wallet claims.
    pub fn erase_state(&mut self) -> Result<()> {
        self.env.store.erase(&self.id)?;
        if let Some(market) = &self.market {
            let db = &self.env.wallet_db;
            db.alloc(self.wallet_key(market, &market.currency_symbol), 0.0);
            db.alloc(self.wallet_key(market, &market.asset_symbol), 0.0);
        }
        let inverted = self.market.as_ref().is_some_and(|m| m.invert_price);
        self.state = TraderState::fresh(new_uid(&self.id), inverted);
        Ok(())
    }

    pub fn snapshot(&self) -> TraderSnapshot {
        TraderSnapshot {
            id: self.id.clone(),
            broker: self.env.broker.clone(),
            pair: self.config.pair.clone(),
            enabled: self.config.enabled,
            initialized: self.is_initialized(),
            stopped: self.state.stopped,
            position: self.state.position,
            unconfirmed_position: self.state.unconfirmed_position.position(),
            last_price: self.last_price,
            equilibrium: self.state.equilibrium,
            trades: self.state.trades.len(),
            achieve: self.state.achieve.is_some(),
            last_event: self.last_event,
            errors: self.errors.clone(),
        }
    }
}

/// Request orders toward the achieve target. Returns true once the position
/// is within two minimum orders of it.
fn drive_achieve(ctl: &mut Control<'_>, achieve: AchieveMode) -> bool {
    let st = ctl.state().clone();
    let min = ctl.market().min_order_size(st.cur_price);
    let current = st.position + st.unconfirmed_position;
    ctl.set_equilibrium_price(st.cur_price);

    if (achieve.target_position - current).abs() < 2.0 * min {
        return true;
    }
    let size = achieve.target_position - st.position;
    if size > 0.0 {
        ctl.limit_buy(st.highest_buy_price, size);
    } else {
        ctl.limit_sell(st.lowest_sell_price, -size);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{FeeScheme, MockExchange, PaperExchange};
    use crate::report::MemoryReporter;
    use crate::strategy::ChartPoint;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Scripted {
        buy: Option<(f64, f64)>,
        sell: Option<(f64, f64)>,
        equity: Option<f64>,
        seen: Arc<Mutex<Vec<(MarketEvent, f64)>>>,
    }

    impl Strategy for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn run(&self, ctl: &mut Control<'_>) -> Result<Box<dyn Strategy>> {
            let st = ctl.state();
            self.seen.lock().unwrap().push((st.event, st.event_price));
            if let Some(equity) = self.equity {
                ctl.set_equity_allocation(equity);
            }
            if let Some((price, size)) = self.buy {
                ctl.limit_buy(price, size);
            }
            if let Some((price, size)) = self.sell {
                ctl.limit_sell(price, size);
            }
            Ok(Box::new(self.clone()))
        }

        fn reset(&self, _state: &MarketState) -> Result<Box<dyn Strategy>> {
            Ok(Box::new(self.clone()))
        }

        fn save(&self) -> serde_json::Value {
            serde_json::Value::Null
        }

        fn load(&self, _blob: &serde_json::Value) -> Result<Box<dyn Strategy>> {
            Ok(Box::new(self.clone()))
        }

        fn calc_initial_position(&self, _state: &MarketState) -> f64 {
            0.0
        }

        fn chart_point(&self, _price: f64) -> ChartPoint {
            ChartPoint {
                valid: false,
                position: 0.0,
                equity: 0.0,
            }
        }
    }

    fn market() -> MarketInfo {
        MarketInfo {
            asset_symbol: "BTC".to_string(),
            currency_symbol: "USD".to_string(),
            asset_step: 0.1,
            currency_step: 0.5,
            min_size: 1.0,
            min_volume: 0.0,
            fees: 0.0,
            fee_scheme: FeeScheme::Currency,
            leverage: 0.0,
            invert_price: false,
            wallet_id: "main".to_string(),
        }
    }

    async fn paper() -> Arc<PaperExchange> {
        let ex = Arc::new(PaperExchange::new());
        ex.add_market("BTCUSD", market(), 99.0, 101.0).await;
        ex.set_balance("main", "USD", 10_000.0).await;
        ex
    }

    fn env(exchange: Arc<dyn Exchange>) -> TraderEnv {
        TraderEnv {
            broker: "paper".to_string(),
            exchange,
            wallet_db: Arc::new(WalletDb::new()),
            conflicts: Arc::new(ConflictMap::new()),
            store: Arc::new(StateStore::in_memory().unwrap()),
            reporter: Arc::new(MemoryReporter::new()),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    fn trader(id: &str, env: TraderEnv, strategy: Scripted) -> Trader {
        let cfg = TraderConfig::new("paper", "BTCUSD");
        let spread = create_spread_generator(&cfg.spread);
        Trader::with_components(id, cfg, env, Box::new(strategy), spread)
    }

    /// Broker with a valid ticker, 1 BTC and 10000 USD, no resting orders.
    fn quiet_mock(trades: Vec<Trade>) -> MockExchange {
        let mut mock = MockExchange::new();
        mock.expect_get_market_info().returning(|_| Ok(market()));
        mock.expect_get_ticker().returning(|_| {
            Ok(Ticker {
                bid: 99.0,
                ask: 101.0,
                last: 100.0,
                time: Utc::now(),
            })
        });
        mock.expect_get_balance()
            .returning(|symbol, _| Ok(if symbol == "USD" { 10_000.0 } else { 1.0 }));
        mock.expect_get_open_orders().returning(|_| Ok(Vec::new()));
        mock.expect_sync_trades().returning(move |_, _| {
            Ok(TradeSync {
                trades: trades.clone(),
                cursor: Some("c1".to_string()),
            })
        });
        mock
    }

    async fn own_order_id(ex: &PaperExchange) -> String {
        ex.get_open_orders("BTCUSD").await.unwrap()[0].id.clone()
    }

    #[test]
    fn test_magic_tag_is_stable() {
        let tag = magic_tag("btc-1");
        assert_eq!(tag, magic_tag("btc-1"));
        assert_ne!(tag, magic_tag("btc-2"));
        assert!(tag.starts_with("mm"));
        assert_eq!(tag.len(), 10);
    }

    #[tokio::test]
    async fn test_partial_fills_commit_at_announced_size() {
        let ex = paper().await;
        let strategy = Scripted {
            buy: Some((98.0, 10.0)),
            ..Default::default()
        };
        let seen = strategy.seen.clone();
        let mut t = trader("t1", env(ex.clone()), strategy);

        t.run().await;
        assert!(t.snapshot().errors.generic.is_none());
        assert_eq!(ex.stats().await.batch_calls, 1);
        let id = own_order_id(&ex).await;

        ex.fill_order(&id, 4.0).await.unwrap();
        t.run().await;
        ex.fill_order(&id, 4.0).await.unwrap();
        t.run().await;
        assert_eq!(t.state().position, 0.0);
        assert_eq!(t.state().unconfirmed_position.position(), 8.0);
        // the shrinking order still matches the residual request
        assert_eq!(ex.stats().await.batch_calls, 1);

        ex.fill_order(&id, 2.0).await.unwrap();
        t.run().await;
        assert_eq!(t.state().position, 10.0);
        assert_eq!(t.state().completed_trades, 3);

        let events: Vec<MarketEvent> = seen.lock().unwrap().iter().map(|(e, _)| *e).collect();
        assert_eq!(
            events,
            vec![
                MarketEvent::Start,
                MarketEvent::Idle,
                MarketEvent::Idle,
                MarketEvent::Trade
            ]
        );
        assert_eq!(seen.lock().unwrap()[3].1, 98.0);
    }

    #[tokio::test]
    async fn test_second_trader_on_pair_conflicts() {
        let ex = paper().await;
        let shared = env(ex);
        let mut first = trader("a", shared.clone(), Scripted::default());
        let mut second = trader("b", shared.clone(), Scripted::default());
        first.init().await.unwrap();

        let err = second.init().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TraderError>(),
            Some(TraderError::Conflict(_))
        ));

        let mut cfg = TraderConfig::new("paper", "BTCUSD");
        cfg.dont_allocate = true;
        let spread = create_spread_generator(&cfg.spread);
        let mut passive = Trader::with_components("c", cfg, shared, Box::new(Scripted::default()), spread);
        passive.init().await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_trade_reported_after_threshold() {
        let ex = paper().await;
        let mut t = trader("t", env(ex.clone()), Scripted::default());
        t.run().await;

        // assets appear without any reported fill
        ex.set_balance("main", "BTC", 5.0).await;
        t.run().await;
        t.run().await;
        assert!(t.snapshot().errors.generic.is_none());
        t.run().await;
        let err = t.snapshot().errors.generic.unwrap();
        assert!(err.contains("lost trade"), "{}", err);
    }

    #[tokio::test]
    async fn test_invalid_ticker_places_nothing() {
        let mut mock = MockExchange::new();
        mock.expect_get_market_info().returning(|_| Ok(market()));
        mock.expect_get_ticker().returning(|_| {
            Ok(Ticker {
                bid: 101.0,
                ask: 99.0,
                last: 100.0,
                time: Utc::now(),
            })
        });
        mock.expect_batch_place_order().times(0);
        mock.expect_sync_trades().times(0);

        let mut t = trader("t", env(Arc::new(mock)), Scripted::default());
        t.run().await;
        let err = t.snapshot().errors.generic.unwrap();
        assert!(err.contains("invalid ticker"), "{}", err);
    }

    #[tokio::test]
    async fn test_stop_cancels_and_stays_idle() {
        let ex = paper().await;
        let strategy = Scripted {
            buy: Some((98.0, 2.0)),
            ..Default::default()
        };
        let mut t = trader("t", env(ex.clone()), strategy);
        t.run().await;
        assert_eq!(ex.get_open_orders("BTCUSD").await.unwrap().len(), 1);

        t.stop().await.unwrap();
        assert!(ex.get_open_orders("BTCUSD").await.unwrap().is_empty());

        t.run().await;
        assert!(ex.get_open_orders("BTCUSD").await.unwrap().is_empty());
        let snap = t.snapshot();
        assert!(snap.stopped);
        assert_eq!(snap.errors.generic.as_deref(), Some("stopped"));
    }

    #[tokio::test]
    async fn test_stop_flag_blocks_placement() {
        let ex = paper().await;
        let strategy = Scripted {
            buy: Some((98.0, 2.0)),
            ..Default::default()
        };
        let env = env(ex.clone());
        env.stop_flag.store(true, Ordering::SeqCst);
        let mut t = trader("t", env, strategy);
        t.run().await;
        assert_eq!(ex.stats().await.batch_calls, 0);
    }

    #[tokio::test]
    async fn test_reset_revision_sets_position_once() {
        let ex = paper().await;
        ex.set_balance("main", "BTC", 3.0).await;
        let mut t = trader("t", env(ex.clone()), Scripted::default());
        t.run().await;
        // first start adopts the live balance
        assert_eq!(t.state().position, 3.0);

        t.config.reset = Some(ResetConfig {
            revision: 1,
            position: Some(1.0),
            balance: None,
            achieve: false,
        });
        t.run().await;
        assert_eq!(t.state().position, 1.0);
        assert_eq!(t.state().reset_rev, 1);
        let last = t.state().trades.last().unwrap();
        assert!(last.manual);
        assert_eq!(last.trade.size, -2.0);

        let trades = t.state().trades.len();
        t.run().await;
        assert_eq!(t.state().trades.len(), trades);
    }

    #[tokio::test]
    async fn test_too_small_request_raises_alert() {
        let ex = paper().await;
        let strategy = Scripted {
            sell: Some((102.0, 0.5)),
            ..Default::default()
        };
        let seen = strategy.seen.clone();
        let mut t = trader("t", env(ex.clone()), strategy);
        t.run().await;
        assert!(t.snapshot().errors.sell.unwrap().starts_with("too_small"));

        ex.set_ticker("BTCUSD", 102.5, 103.0).await.unwrap();
        t.run().await;
        assert_eq!(seen.lock().unwrap()[1], (MarketEvent::Alert, 102.0));
    }

    #[tokio::test]
    async fn test_corrupt_state_starts_fresh() {
        let ex = paper().await;
        let env = env(ex);
        env.store.put_raw("t", "{broken").unwrap();
        let mut t = trader("t", env, Scripted::default());
        t.init().await.unwrap();
        assert!(t.state().need_initial_reset);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let ex = paper().await;
        let env = env(ex.clone());
        let strategy = Scripted {
            buy: Some((98.0, 2.0)),
            ..Default::default()
        };
        let mut t = trader("t", env.clone(), strategy.clone());
        t.run().await;
        let id = own_order_id(&ex).await;
        ex.fill_order(&id, 2.0).await.unwrap();
        t.run().await;
        assert_eq!(t.state().position, 2.0);
        t.shutdown().await.unwrap();

        let mut restarted = trader("t", env, strategy);
        restarted.init().await.unwrap();
        assert_eq!(restarted.state().position, 2.0);
        assert!(!restarted.state().need_initial_reset);
    }

    #[tokio::test]
    async fn test_achieve_mode_trades_to_target() {
        let ex = paper().await;
        let mut t = trader("t", env(ex.clone()), Scripted::default());
        t.run().await;
        assert_eq!(t.state().position, 0.0);

        t.config.reset = Some(ResetConfig {
            revision: 1,
            position: Some(5.0),
            balance: None,
            achieve: true,
        });
        t.run().await;
        assert!(t.state().achieve.is_some());
        let orders = ex.get_open_orders("BTCUSD").await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].size, 5.0);

        ex.fill_order(&orders[0].id, 5.0).await.unwrap();
        t.run().await;
        assert_eq!(t.state().position, 5.0);
        assert!(t.state().achieve.is_none());
        assert!(t.snapshot().errors.generic.is_none());
    }

    #[tokio::test]
    async fn test_traders_share_wallet_by_reported_equity() {
        let ex = paper().await;
        let mut eth = market();
        eth.asset_symbol = "ETH".to_string();
        ex.add_market("ETHUSD", eth, 99.0, 101.0).await;
        let shared = env(ex.clone());

        let mut a = trader(
            "a",
            shared.clone(),
            Scripted {
                equity: Some(3000.0),
                ..Default::default()
            },
        );
        let cfg = TraderConfig::new("paper", "ETHUSD");
        let spread = create_spread_generator(&cfg.spread);
        let greedy = Scripted {
            equity: Some(3000.0),
            buy: Some((98.0, 100.0)),
            ..Default::default()
        };
        let mut b = Trader::with_components("b", cfg, shared.clone(), Box::new(greedy), spread);

        a.run().await;
        b.run().await;
        a.run().await;

        let key = |t: &Trader| WalletKey::new("paper", "main", "USD", t.state().uid);
        let claims = shared.wallet_db.query(&key(&a));
        assert_eq!(claims.this_trader, 3000.0);
        assert_eq!(claims.other_traders, 3000.0);
        assert_eq!(shared.wallet_db.query(&key(&b)).this_trader, 3000.0);

        // b can only spend the 7000 that a did not claim
        let orders = ex.get_open_orders("ETHUSD").await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].size, 71.4);
        assert_eq!(b.snapshot().errors.buy.map(|e| e.starts_with("partially_accepted")), Some(true));
    }

    #[tokio::test]
    async fn test_fills_are_folded_in_time_order() {
        let now = Utc::now();
        let fill = |id: &str, time, size: f64| Trade {
            id: id.to_string(),
            time,
            price: 100.0,
            size,
            eff_price: 100.0,
            eff_size: size,
        };
        let mock = quiet_mock(vec![
            fill("2", now, -1.0),
            fill("1", now - chrono::Duration::seconds(10), 2.0),
        ]);
        let mut t = trader("t", env(Arc::new(mock)), Scripted::default());
        t.run().await;

        let ids: Vec<&str> = t.state().trades.iter().map(|r| r.trade.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(t.state().trade_lastid.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_short_placement_result_is_reported() {
        let mut mock = quiet_mock(Vec::new());
        mock.expect_batch_place_order().returning(|_| Ok(Vec::new()));
        let strategy = Scripted {
            buy: Some((98.0, 2.0)),
            ..Default::default()
        };
        let mut t = trader("t", env(Arc::new(mock)), strategy);
        t.run().await;

        let err = t.snapshot().errors.generic.unwrap();
        assert!(err.contains("0 results for 1 orders"), "{}", err);
    }
}
