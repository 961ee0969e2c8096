//! Broker-neutral types exchanged with the `Exchange` capability.
//!
//! Sizes are signed throughout: positive sizes buy, negative sizes sell.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Best bid/ask and last traded price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub time: DateTime<Utc>,
}

impl Ticker {
    /// Mid price between bid and ask.
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) * 0.5
    }

    /// A usable ticker has finite, positive and uncrossed prices.
    pub fn is_valid(&self) -> bool {
        self.bid.is_finite()
            && self.ask.is_finite()
            && self.last.is_finite()
            && self.bid > 0.0
            && self.ask > 0.0
            && self.last > 0.0
            && self.bid <= self.ask
    }
}

/// How the broker charges fees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeScheme {
    /// Fees are taken from the currency leg.
    #[default]
    Currency,
    /// Fees are taken from the asset leg.
    Assets,
    /// Fees are already included in the reported price.
    Income,
}

/// Static trading rules of one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketInfo {
    pub asset_symbol: String,
    pub currency_symbol: String,
    pub asset_step: f64,
    pub currency_step: f64,
    pub min_size: f64,
    pub min_volume: f64,
    pub fees: f64,
    #[serde(default)]
    pub fee_scheme: FeeScheme,
    /// Leverage offered by the market, 0 for spot markets.
    #[serde(default)]
    pub leverage: f64,
    #[serde(default)]
    pub invert_price: bool,
    /// Wallet the market trades from. Markets sharing a wallet share balance.
    #[serde(default)]
    pub wallet_id: String,
}

impl MarketInfo {
    /// True for margin/futures markets where the asset balance is a position.
    pub fn is_leveraged(&self) -> bool {
        self.leverage > 0.0
    }

    /// Smallest order size acceptable at `price`, honouring both the size and
    /// the notional minimum.
    pub fn min_order_size(&self, price: f64) -> f64 {
        let by_volume = if price > 0.0 && self.min_volume > 0.0 {
            crate::utils::round_up_to_step(self.min_volume / price, self.asset_step)
        } else {
            0.0
        };
        self.min_size.max(by_volume).max(self.asset_step)
    }
}

/// One resting order as reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_id: Option<String>,
    /// Remaining (unfilled) signed size.
    pub size: f64,
    pub price: f64,
}

/// Placement request. A zero size with `replace_id` cancels; `price == None`
/// is a market order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrder {
    pub pair: String,
    pub size: f64,
    pub price: Option<f64>,
    pub client_id: Option<String>,
    pub replace_id: Option<String>,
    /// Remaining size the caller expects on the replaced order. The broker
    /// refuses the replacement when a fill changed it meanwhile.
    pub replace_expected_size: Option<f64>,
}

impl NewOrder {
    /// Cancel request for a resting order.
    pub fn cancel(pair: &str, order: &Order) -> Self {
        Self {
            pair: pair.to_string(),
            size: 0.0,
            price: None,
            client_id: order.client_id.clone(),
            replace_id: Some(order.id.clone()),
            replace_expected_size: Some(order.size),
        }
    }

    pub fn is_cancel(&self) -> bool {
        self.size == 0.0 && self.replace_id.is_some()
    }
}

/// Outcome of one entry of a batch placement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlaceResult {
    pub order_id: Option<String>,
    pub error: Option<String>,
}

impl PlaceResult {
    pub fn placed(id: impl Into<String>) -> Self {
        Self {
            order_id: Some(id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            order_id: None,
            error: Some(error.into()),
        }
    }
}

/// One fill reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub time: DateTime<Utc>,
    pub price: f64,
    pub size: f64,
    /// Price after fees.
    pub eff_price: f64,
    /// Size after fees.
    pub eff_size: f64,
}

/// Result of `Exchange::sync_trades`.
#[derive(Debug, Clone, Default)]
pub struct TradeSync {
    pub trades: Vec<Trade>,
    /// Opaque cursor to pass to the next sync.
    pub cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market() -> MarketInfo {
        MarketInfo {
            asset_symbol: "BTC".to_string(),
            currency_symbol: "USDT".to_string(),
            asset_step: 0.001,
            currency_step: 0.01,
            min_size: 0.001,
            min_volume: 10.0,
            fees: 0.001,
            fee_scheme: FeeScheme::Currency,
            leverage: 0.0,
            invert_price: false,
            wallet_id: "spot".to_string(),
        }
    }

    #[test]
    fn test_min_order_size_uses_notional() {
        let m = market();
        // 10 USDT at 20000 is 0.0005 BTC, rounded up to a step
        assert_eq!(m.min_order_size(20000.0), 0.001);
        // 10 USDT at 2000 is 0.005 BTC
        assert_eq!(m.min_order_size(2000.0), 0.005);
    }

    #[test]
    fn test_ticker_validation() {
        let now = Utc::now();
        let ok = Ticker { bid: 99.0, ask: 101.0, last: 100.0, time: now };
        let crossed = Ticker { bid: 102.0, ask: 101.0, last: 100.0, time: now };
        let negative = Ticker { bid: -1.0, ask: 101.0, last: 100.0, time: now };
        assert!(ok.is_valid());
        assert!(!crossed.is_valid());
        assert!(!negative.is_valid());
        assert_eq!(ok.mid(), 100.0);
    }
}
