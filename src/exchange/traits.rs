//! Broker capability consumed by the traders.
//!
//! The trait is deliberately small: everything a reconciliation cycle needs
//! and nothing else. Concrete REST or subprocess adapters live outside this
//! crate and implement it; `PaperExchange` is the in-process implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use super::types::{MarketInfo, NewOrder, Order, PlaceResult, Ticker, TradeSync};

/// Broker connection shared by every trader configured on it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Current best bid/ask for `pair`.
    async fn get_ticker(&self, pair: &str) -> anyhow::Result<Ticker>;

    /// Total balance of `symbol` in the wallet that trades `pair`. On
    /// leveraged markets the asset balance is the open position.
    async fn get_balance(&self, symbol: &str, pair: &str) -> anyhow::Result<f64>;

    /// Every resting order on `pair`, including those of other traders.
    async fn get_open_orders(&self, pair: &str) -> anyhow::Result<Vec<Order>>;

    /// Place, replace and cancel orders in one call. The result has one entry
    /// per request; a failed entry does not fail the batch.
    async fn batch_place_order(&self, orders: &[NewOrder]) -> anyhow::Result<Vec<PlaceResult>>;

    /// Fills on `pair` newer than `cursor`. A `None` cursor only establishes
    /// the starting point and returns no trades.
    async fn sync_trades(&self, cursor: Option<String>, pair: &str) -> anyhow::Result<TradeSync>;

    /// Drop cached broker data. Repeated calls with the same timestamp are
    /// no-ops, so every trader of a cycle may call it.
    async fn reset(&self, timestamp: DateTime<Utc>) -> anyhow::Result<()>;

    async fn get_market_info(&self, pair: &str) -> anyhow::Result<MarketInfo>;
}

/// Broker registry keyed by the broker name used in trader configs.
pub type Brokers = HashMap<String, Arc<dyn Exchange>>;
