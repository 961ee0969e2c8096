//! Persistent per-trader state document.

use crate::exchange::Trade;
use crate::trading::Acb;
use serde::{Deserialize, Serialize};

/// A committed or synthetic trade as kept in the trade history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    #[serde(flatten)]
    pub trade: Trade,
    /// Change of realized PnL caused by this trade.
    pub norm_profit: f64,
    /// Running sum of `norm_profit`.
    pub norm_accum: f64,
    pub neutral_price: Option<f64>,
    /// Created by a reset or by the strategy altering the position.
    #[serde(default)]
    pub manual: bool,
}

/// Trading toward a requested position after a reset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AchieveMode {
    pub target_position: f64,
    pub available_balance: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraderState {
    /// Random id used in wallet ledger keys.
    pub uid: u32,
    /// Broker cursor for incremental trade sync.
    pub trade_lastid: Option<String>,
    /// Committed position.
    pub position: f64,
    /// Trades in `trades` that are part of `position`.
    pub completed_trades: usize,
    /// Fills not yet committed, with their own cost basis.
    pub unconfirmed_position: Acb,
    pub acb: Acb,
    pub spent_currency: f64,
    pub last_known_live_position: f64,
    pub last_known_live_balance: f64,
    pub last_trade_price: f64,
    pub last_trade_size: f64,
    /// Budget not covered by the strategy's equity at the last commit.
    pub last_trade_eq_extra: Option<f64>,
    pub reset_rev: u64,
    pub achieve: Option<AchieveMode>,
    /// Commit thresholds announced by the last placement.
    pub target_buy: Option<f64>,
    pub target_sell: Option<f64>,
    /// Prices remembered from `TooSmall` rejections.
    pub alert_buy: Option<f64>,
    pub alert_sell: Option<f64>,
    /// Currency budget set by a reset.
    pub budget: Option<f64>,
    pub equilibrium: Option<f64>,
    pub neutral_price: Option<f64>,
    pub equity_allocation: Option<f64>,
    pub stopped: bool,
    pub need_initial_reset: bool,
    pub lost_trade_cycles: u32,
    pub strategy: serde_json::Value,
    pub spread: serde_json::Value,
    pub trades: Vec<TradeRecord>,
}

impl TraderState {
    /// State of a trader that has never run.
    pub fn fresh(uid: u32, inverted: bool) -> Self {
        Self {
            uid,
            unconfirmed_position: Acb::empty(inverted),
            acb: Acb::empty(inverted),
            need_initial_reset: true,
            ..Default::default()
        }
    }

    pub fn accumulated_profit(&self) -> f64 {
        self.trades.last().map(|t| t.norm_accum).unwrap_or(0.0)
    }

    /// Append a trade, computing its profit from the cost basis.
    pub fn push_trade(&mut self, trade: Trade, manual: bool) {
        let rpnl_before = self.acb.rpnl();
        self.acb = self.acb.execution(trade.eff_price, trade.eff_size);
        let norm_profit = self.acb.rpnl() - rpnl_before;
        self.trades.push(TradeRecord {
            trade,
            norm_profit,
            norm_accum: self.accumulated_profit() + norm_profit,
            neutral_price: self.neutral_price,
            manual,
        });
    }
}
