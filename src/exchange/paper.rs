//! In-memory broker for paper trading and tests.
//!
//! Keeps balances per wallet, resting orders per pair and an append-only fill
//! history. Resting orders fill at their own price when the ticker crosses
//! them; partial fills can be forced with [`PaperExchange::fill_order`].

use super::traits::Exchange;
use super::types::*;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct PaperOrder {
    pair: String,
    order: Order,
}

/// Counters used to observe how the engine drives the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaperStats {
    /// Calls of `batch_place_order`.
    pub batch_calls: u64,
    /// Non-cancel entries accepted (new or replacing orders).
    pub placed: u64,
    /// Cancel entries accepted.
    pub cancelled: u64,
    /// Distinct reset timestamps seen.
    pub resets: u64,
    /// Fills generated.
    pub fills: u64,
}

#[derive(Debug, Default)]
struct PaperState {
    markets: HashMap<String, (MarketInfo, Ticker)>,
    /// (wallet, symbol) -> balance
    balances: HashMap<(String, String), f64>,
    orders: Vec<PaperOrder>,
    trades: Vec<(String, Trade)>,
    last_reset: Option<DateTime<Utc>>,
    pending_errors: VecDeque<String>,
    stats: PaperStats,
}

impl PaperState {
    fn market(&self, pair: &str) -> Result<&(MarketInfo, Ticker)> {
        self.markets
            .get(pair)
            .ok_or_else(|| anyhow!("Unknown pair {}", pair))
    }

    fn balance_mut(&mut self, wallet: &str, symbol: &str) -> &mut f64 {
        self.balances
            .entry((wallet.to_string(), symbol.to_string()))
            .or_insert(0.0)
    }

    /// Execute `size` of a trade on `pair` at `price`, updating balances and
    /// the fill history.
    fn execute(&mut self, pair: &str, price: f64, size: f64, next_trade_id: u64) -> Result<()> {
        let (info, _) = self.market(pair)?.clone();
        let eff_price = price * (1.0 + info.fees * size.signum());
        let wallet = info.wallet_id.clone();

        if info.is_leveraged() {
            *self.balance_mut(&wallet, &info.asset_symbol) += size;
            *self.balance_mut(&wallet, &info.currency_symbol) -= size.abs() * price * info.fees;
        } else {
            *self.balance_mut(&wallet, &info.asset_symbol) += size;
            *self.balance_mut(&wallet, &info.currency_symbol) -= size * eff_price;
        }

        let trade = Trade {
            id: format!("T{}", next_trade_id),
            time: Utc::now(),
            price,
            size,
            eff_price,
            eff_size: size,
        };
        debug!(%pair, %price, %size, id = %trade.id, "Paper fill");
        self.trades.push((pair.to_string(), trade));
        self.stats.fills += 1;
        Ok(())
    }
}

/// Paper broker shared by any number of traders.
pub struct PaperExchange {
    state: RwLock<PaperState>,
    order_id_counter: AtomicU64,
    trade_id_counter: AtomicU64,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PaperState::default()),
            order_id_counter: AtomicU64::new(1),
            trade_id_counter: AtomicU64::new(1),
        }
    }

    /// Register a market with an initial bid/ask.
    pub async fn add_market(&self, pair: &str, info: MarketInfo, bid: f64, ask: f64) {
        let ticker = Ticker {
            bid,
            ask,
            last: (bid + ask) * 0.5,
            time: Utc::now(),
        };
        self.state
            .write()
            .await
            .markets
            .insert(pair.to_string(), (info, ticker));
    }

    pub async fn set_balance(&self, wallet: &str, symbol: &str, amount: f64) {
        *self.state.write().await.balance_mut(wallet, symbol) = amount;
    }

    /// Move the market. Resting orders crossed by the new prices fill in full.
    pub async fn set_ticker(&self, pair: &str, bid: f64, ask: f64) -> Result<()> {
        let mut state = self.state.write().await;
        {
            let (_, ticker) = state
                .markets
                .get_mut(pair)
                .ok_or_else(|| anyhow!("Unknown pair {}", pair))?;
            ticker.bid = bid;
            ticker.ask = ask;
            ticker.last = (bid + ask) * 0.5;
            ticker.time = Utc::now();
        }

        let (crossed, resting): (Vec<PaperOrder>, Vec<PaperOrder>) =
            std::mem::take(&mut state.orders).into_iter().partition(|o| {
                o.pair == pair
                    && ((o.order.size > 0.0 && o.order.price >= ask)
                        || (o.order.size < 0.0 && o.order.price <= bid))
            });
        state.orders = resting;

        for o in crossed {
            let id = self.trade_id_counter.fetch_add(1, Ordering::SeqCst);
            state.execute(pair, o.order.price, o.order.size, id)?;
        }
        Ok(())
    }

    /// Fill `amount` (unsigned) of a resting order at its price.
    pub async fn fill_order(&self, order_id: &str, amount: f64) -> Result<()> {
        let mut state = self.state.write().await;
        let idx = state
            .orders
            .iter()
            .position(|o| o.order.id == order_id)
            .ok_or_else(|| anyhow!("Unknown order {}", order_id))?;

        let (pair, price, remaining) = {
            let o = &state.orders[idx];
            (o.pair.clone(), o.order.price, o.order.size)
        };
        let amount = amount.min(remaining.abs());
        let size = amount * remaining.signum();

        let left = remaining - size;
        if left.abs() < 1e-12 {
            state.orders.remove(idx);
        } else {
            state.orders[idx].order.size = left;
        }

        let id = self.trade_id_counter.fetch_add(1, Ordering::SeqCst);
        state.execute(&pair, price, size, id)
    }

    /// Record a fill that did not come from any resting order, as if someone
    /// traded on the account by hand.
    pub async fn inject_trade(&self, pair: &str, price: f64, size: f64) -> Result<()> {
        let mut state = self.state.write().await;
        let id = self.trade_id_counter.fetch_add(1, Ordering::SeqCst);
        state.execute(pair, price, size, id)
    }

    /// Make the next placement entries fail with `error`.
    pub async fn fail_next_placement(&self, error: &str) {
        self.state
            .write()
            .await
            .pending_errors
            .push_back(error.to_string());
    }

    pub async fn stats(&self) -> PaperStats {
        self.state.read().await.stats
    }

    pub async fn ticker(&self, pair: &str) -> Option<Ticker> {
        self.state.read().await.markets.get(pair).map(|(_, t)| *t)
    }

    fn next_order_id(&self) -> String {
        format!("P{}", self.order_id_counter.fetch_add(1, Ordering::SeqCst))
    }

    fn place_one(&self, state: &mut PaperState, req: &NewOrder) -> Result<PlaceResult> {
        if let Some(pending) = state.pending_errors.pop_front() {
            return Ok(PlaceResult::failed(pending));
        }

        let ticker = state.market(&req.pair)?.1;

        if let Some(replace_id) = &req.replace_id {
            let Some(idx) = state
                .orders
                .iter()
                .position(|o| &o.order.id == replace_id && o.pair == req.pair)
            else {
                return Ok(PlaceResult::failed(format!("Order {} not found", replace_id)));
            };
            if let Some(expected) = req.replace_expected_size {
                if (state.orders[idx].order.size - expected).abs() > 1e-9 {
                    return Ok(PlaceResult::failed(format!(
                        "Order {} changed size ({} != {})",
                        replace_id, state.orders[idx].order.size, expected
                    )));
                }
            }
            state.orders.remove(idx);
            if req.size == 0.0 {
                state.stats.cancelled += 1;
                return Ok(PlaceResult::default());
            }
        } else if req.size == 0.0 {
            return Ok(PlaceResult::failed("Zero size order"));
        }

        if !req.size.is_finite() {
            return Ok(PlaceResult::failed("Invalid size"));
        }

        if let Some(price) = req.price {
            if !price.is_finite() || price <= 0.0 {
                return Ok(PlaceResult::failed("Invalid price"));
            }
        }

        state.stats.placed += 1;
        let id = self.next_order_id();
        let crosses = |price: f64| {
            (req.size > 0.0 && price >= ticker.ask) || (req.size < 0.0 && price <= ticker.bid)
        };

        match req.price {
            None => {
                let price = if req.size > 0.0 { ticker.ask } else { ticker.bid };
                let trade_id = self.trade_id_counter.fetch_add(1, Ordering::SeqCst);
                state.execute(&req.pair, price, req.size, trade_id)?;
            }
            Some(price) if crosses(price) => {
                let trade_id = self.trade_id_counter.fetch_add(1, Ordering::SeqCst);
                state.execute(&req.pair, price, req.size, trade_id)?;
            }
            Some(price) => state.orders.push(PaperOrder {
                pair: req.pair.clone(),
                order: Order {
                    id: id.clone(),
                    client_id: req.client_id.clone(),
                    size: req.size,
                    price,
                },
            }),
        }

        Ok(PlaceResult::placed(id))
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn get_ticker(&self, pair: &str) -> Result<Ticker> {
        Ok(self.state.read().await.market(pair)?.1)
    }

    async fn get_balance(&self, symbol: &str, pair: &str) -> Result<f64> {
        let state = self.state.read().await;
        let (info, _) = state.market(pair)?;
        Ok(state
            .balances
            .get(&(info.wallet_id.clone(), symbol.to_string()))
            .copied()
            .unwrap_or(0.0))
    }

    async fn get_open_orders(&self, pair: &str) -> Result<Vec<Order>> {
        let state = self.state.read().await;
        state.market(pair)?;
        Ok(state
            .orders
            .iter()
            .filter(|o| o.pair == pair)
            .map(|o| o.order.clone())
            .collect())
    }

    async fn batch_place_order(&self, orders: &[NewOrder]) -> Result<Vec<PlaceResult>> {
        let mut state = self.state.write().await;
        state.stats.batch_calls += 1;
        orders
            .iter()
            .map(|req| self.place_one(&mut state, req))
            .collect()
    }

    async fn sync_trades(&self, cursor: Option<String>, pair: &str) -> Result<TradeSync> {
        let state = self.state.read().await;
        state.market(pair)?;
        let end = state.trades.len();

        let Some(cursor) = cursor else {
            return Ok(TradeSync {
                trades: Vec::new(),
                cursor: Some(end.to_string()),
            });
        };

        let start: usize = cursor
            .parse()
            .map_err(|_| anyhow!("Invalid trade cursor {:?}", cursor))?;
        if start > end {
            bail!("Trade cursor {} is ahead of history ({})", start, end);
        }

        let trades = state.trades[start..]
            .iter()
            .filter(|(p, _)| p == pair)
            .map(|(_, t)| t.clone())
            .collect();

        Ok(TradeSync {
            trades,
            cursor: Some(end.to_string()),
        })
    }

    async fn reset(&self, timestamp: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        if state.last_reset != Some(timestamp) {
            state.last_reset = Some(timestamp);
            state.stats.resets += 1;
            debug!(%timestamp, "Paper broker reset");
        }
        Ok(())
    }

    async fn get_market_info(&self, pair: &str) -> Result<MarketInfo> {
        Ok(self.state.read().await.market(pair)?.0.clone())
    }
}

impl PaperExchange {
    /// Log a one-line summary of balances, used by the CLI between cycles.
    pub async fn log_balances(&self, name: &str) {
        let state = self.state.read().await;
        for ((wallet, symbol), amount) in &state.balances {
            info!(broker = %name, %wallet, %symbol, %amount, "Paper balance");
        }
    }
}
