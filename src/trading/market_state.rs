//! Per-cycle market snapshot handed to strategies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the strategy is being run this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketEvent {
    /// First cycle after the trader was initialized.
    Start,
    /// Nothing committed since the last cycle.
    #[default]
    Idle,
    /// Fills reached the announced commit threshold.
    Trade,
    /// The price crossed a remembered alert level.
    Alert,
}

impl fmt::Display for MarketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketEvent::Start => write!(f, "start"),
            MarketEvent::Idle => write!(f, "idle"),
            MarketEvent::Trade => write!(f, "trade"),
            MarketEvent::Alert => write!(f, "alert"),
        }
    }
}

/// Read-only view of one trader's market at the start of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketState {
    pub event: MarketEvent,
    pub cur_price: f64,
    pub cur_time: DateTime<Utc>,
    /// Price of the event: commit price for trades, alert level for alerts,
    /// current price otherwise.
    pub event_price: f64,
    pub event_time: DateTime<Utc>,

    /// Committed position.
    pub position: f64,
    /// Fills not yet committed.
    pub unconfirmed_position: f64,
    /// Currency available to this trader.
    pub balance: f64,
    pub equity: f64,
    /// Current leverage, `|position| * price / equity`.
    pub leverage: f64,

    pub highest_buy_price: f64,
    pub lowest_sell_price: f64,
    pub sug_buy_price: f64,
    pub sug_sell_price: f64,

    pub last_trade_price: f64,
    pub last_trade_size: f64,

    /// Broker-reported balances (external balance already removed).
    pub live_assets: f64,
    pub live_currency: f64,
    /// Balances available after other traders' wallet claims.
    pub allocated_assets: f64,
    pub allocated_currency: f64,

    pub open_price: Option<f64>,
    pub rpnl: f64,
    pub upnl: f64,
    /// Currency spent on buys minus currency received from sells.
    pub spent_currency: f64,

    pub leveraged: bool,
    pub inverted: bool,
}

impl MarketState {
    /// Equity for a market of the given kind.
    pub fn compute_equity(leveraged: bool, inverted: bool, balance: f64, position: f64, price: f64) -> f64 {
        if leveraged {
            balance
        } else if inverted {
            balance + position / price
        } else {
            balance + position * price
        }
    }

    /// Equity if the price moved to `price` with the current position.
    pub fn equity_at(&self, price: f64) -> f64 {
        if self.inverted {
            self.equity + self.position * (1.0 / self.cur_price - 1.0 / price)
        } else {
            self.equity + self.position * (price - self.cur_price)
        }
    }

    /// Snapshot used by unit tests and by strategies' own tests.
    pub fn sample(price: f64, position: f64, balance: f64) -> Self {
        let now = Utc::now();
        Self {
            event: MarketEvent::Idle,
            cur_price: price,
            cur_time: now,
            event_price: price,
            event_time: now,
            position,
            unconfirmed_position: 0.0,
            balance,
            equity: Self::compute_equity(false, false, balance, position, price),
            leverage: 0.0,
            highest_buy_price: price,
            lowest_sell_price: price,
            sug_buy_price: price,
            sug_sell_price: price,
            last_trade_price: price,
            last_trade_size: 0.0,
            live_assets: position,
            live_currency: balance,
            allocated_assets: position,
            allocated_currency: balance,
            open_price: None,
            rpnl: 0.0,
            upnl: 0.0,
            spent_currency: 0.0,
            leveraged: false,
            inverted: false,
        }
    }
}
