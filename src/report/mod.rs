//! Reporting sink.
//!
//! Traders push their orders, trades, price, summary and errors here after
//! every cycle. `MemoryReporter` keeps the latest values per trader for the
//! CLI and tests.

use crate::exchange::Order;
use crate::trader::TradeRecord;
use crate::trading::MarketEvent;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Standing user-visible errors of one trader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraderErrors {
    pub buy: Option<String>,
    pub sell: Option<String>,
    pub generic: Option<String>,
}

impl TraderErrors {
    pub fn is_empty(&self) -> bool {
        self.buy.is_none() && self.sell.is_none() && self.generic.is_none()
    }
}

/// Price range in which the strategy keeps enough budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SafeRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Per-cycle summary of a trader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MiscReport {
    pub event: MarketEvent,
    /// Sign of the last committed trade.
    pub trade_dir: i8,
    pub achieve: bool,
    pub enabled: bool,
    pub equilibrium: Option<f64>,
    pub spread: f64,
    pub dynmult_buy: f64,
    pub dynmult_sell: f64,
    pub safe_range: SafeRange,
    pub budget_allocated: f64,
    pub position: f64,
    pub open_price: Option<f64>,
    pub rpnl: f64,
    pub upnl: f64,
    /// Sum of normalized profit over the trade history.
    pub accumulated_profit: f64,
    /// Values reported by the strategy.
    pub custom: BTreeMap<String, serde_json::Value>,
}

pub trait Reporter: Send + Sync {
    fn report_orders(&self, trader: &str, orders: &[Order]);
    fn report_trades(&self, trader: &str, trades: &[TradeRecord]);
    fn report_price(&self, trader: &str, price: f64);
    fn report_misc(&self, trader: &str, misc: &MiscReport);
    fn report_errors(&self, trader: &str, errors: &TraderErrors);
    /// Forget everything, called when the trader set is replaced.
    fn clear(&self);
}

/// Latest reported values of one trader.
#[derive(Debug, Clone, Default)]
pub struct TraderReport {
    pub orders: Vec<Order>,
    pub trades: Vec<TradeRecord>,
    pub price: Option<f64>,
    pub misc: Option<MiscReport>,
    pub errors: TraderErrors,
}

#[derive(Default)]
pub struct MemoryReporter {
    reports: RwLock<HashMap<String, TraderReport>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, trader: &str) -> Option<TraderReport> {
        self.reports.read().ok()?.get(trader).cloned()
    }

    pub fn traders(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .reports
            .read()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn update(&self, trader: &str, f: impl FnOnce(&mut TraderReport)) {
        if let Ok(mut reports) = self.reports.write() {
            f(reports.entry(trader.to_string()).or_default());
        }
    }
}

impl Reporter for MemoryReporter {
    fn report_orders(&self, trader: &str, orders: &[Order]) {
        self.update(trader, |r| r.orders = orders.to_vec());
    }

    fn report_trades(&self, trader: &str, trades: &[TradeRecord]) {
        self.update(trader, |r| r.trades = trades.to_vec());
    }

    fn report_price(&self, trader: &str, price: f64) {
        self.update(trader, |r| r.price = Some(price));
    }

    fn report_misc(&self, trader: &str, misc: &MiscReport) {
        self.update(trader, |r| r.misc = Some(misc.clone()));
    }

    fn report_errors(&self, trader: &str, errors: &TraderErrors) {
        self.update(trader, |r| r.errors = errors.clone());
    }

    fn clear(&self) {
        if let Ok(mut reports) = self.reports.write() {
            reports.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_reporter_keeps_latest() {
        let r = MemoryReporter::new();
        r.report_price("a", 100.0);
        r.report_price("a", 101.0);
        r.report_errors(
            "b",
            &TraderErrors {
                generic: Some("stopped".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(r.get("a").unwrap().price, Some(101.0));
        assert_eq!(r.traders(), vec!["a".to_string(), "b".to_string()]);

        r.clear();
        assert!(r.get("a").is_none());
    }
}
