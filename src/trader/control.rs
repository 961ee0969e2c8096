//! Facade through which a strategy reads the market and requests orders.
//!
//! Every request is validated against market rules and the trader's limits.
//! Validation order: price side, size, step rounding, minimum size, position
//! limits, cost limit, leverage, spot funds.

use crate::config::TraderConfig;
use crate::exchange::MarketInfo;
use crate::report::SafeRange;
use crate::trading::{LimitOrder, MarketState, OrderCheck, OrderCheckCode, OrderError, Side};
use crate::utils::{round_down_to_step, round_up_to_step};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

/// Trader limits applied to every request.
#[derive(Debug, Clone, Default)]
pub struct OrderLimits {
    pub min_position: Option<f64>,
    pub max_position: Option<f64>,
    pub max_costs: Option<f64>,
    /// 0 disables the check.
    pub max_leverage: f64,
}

impl From<&TraderConfig> for OrderLimits {
    fn from(cfg: &TraderConfig) -> Self {
        Self {
            min_position: cfg.min_position,
            max_position: cfg.max_position,
            max_costs: cfg.max_costs,
            max_leverage: cfg.max_leverage,
        }
    }
}

/// Everything a strategy asked for during one run.
#[derive(Debug, Clone, Default)]
pub struct ControlOutcome {
    pub buy: Option<LimitOrder>,
    pub sell: Option<LimitOrder>,
    /// Signed size of a market order.
    pub market_order: Option<f64>,
    pub buy_error: Option<OrderError>,
    pub sell_error: Option<OrderError>,
    /// Prices of `TooSmall` rejections, remembered for alert events.
    pub alert_buy: Option<f64>,
    pub alert_sell: Option<f64>,
    /// (new position, price)
    pub alter_position: Option<(f64, f64)>,
    pub equilibrium: Option<f64>,
    pub neutral_price: Option<f64>,
    pub equity_allocation: Option<f64>,
    pub safe_range: Option<SafeRange>,
    pub reports: BTreeMap<String, serde_json::Value>,
    pub logs: Vec<String>,
}

pub struct Control<'a> {
    state: &'a MarketState,
    market: &'a MarketInfo,
    limits: &'a OrderLimits,
    out: ControlOutcome,
}

impl<'a> Control<'a> {
    pub fn new(state: &'a MarketState, market: &'a MarketInfo, limits: &'a OrderLimits) -> Self {
        Self {
            state,
            market,
            limits,
            out: ControlOutcome::default(),
        }
    }

    pub fn state(&self) -> &MarketState {
        self.state
    }

    pub fn market(&self) -> &MarketInfo {
        self.market
    }

    pub fn finish(self) -> ControlOutcome {
        self.out
    }

    // ----- validation -----

    pub fn check_buy_size(&self, price: f64, size: f64) -> OrderCheck {
        self.check_size(Side::Buy, price, size)
    }

    pub fn check_sell_size(&self, price: f64, size: f64) -> OrderCheck {
        self.check_size(Side::Sell, price, size)
    }

    fn check_size(&self, side: Side, price: f64, size: f64) -> OrderCheck {
        let st = self.state;
        let m = self.market;

        let price_ok = price.is_finite()
            && price > 0.0
            && match side {
                Side::Buy => price <= st.highest_buy_price,
                Side::Sell => price >= st.lowest_sell_price,
            };
        if !price_ok {
            return OrderCheck::rejected(OrderCheckCode::InvalidPrice);
        }
        if !size.is_finite() || size < 0.0 {
            return OrderCheck::rejected(OrderCheckCode::InvalidSize);
        }

        let requested = round_down_to_step(size, m.asset_step);
        let min = m.min_order_size(price);
        if requested < min {
            return OrderCheck::too_small(min);
        }

        let mut allowed = requested;
        let mut limited_by = None;
        let mut limit = |cap: f64, code: OrderCheckCode| {
            let cap = round_down_to_step(cap.max(0.0), m.asset_step);
            if cap < allowed {
                allowed = cap;
                limited_by = Some(code);
            }
        };

        // limits apply to the displayed position, which is negated on inverted markets
        let dir = if m.invert_price { -1.0 } else { 1.0 };
        let shown = st.position * dir;
        match (side.sign() * dir > 0.0, self.limits.max_position, self.limits.min_position) {
            (true, Some(max), _) => limit(max - shown, OrderCheckCode::MaxPosition),
            (false, _, Some(min)) => limit(shown - min, OrderCheckCode::MinPosition),
            _ => {}
        }

        if let (Side::Buy, Some(max_costs)) = (side, self.limits.max_costs) {
            limit((max_costs - st.spent_currency) / price, OrderCheckCode::MaxCosts);
        }

        if st.leveraged && self.limits.max_leverage > 0.0 {
            let equity = st.equity_at(price);
            if equity <= 0.0 {
                return OrderCheck::rejected(OrderCheckCode::MaxLeverage);
            }
            let max_abs = if m.invert_price {
                self.limits.max_leverage * equity * price
            } else {
                self.limits.max_leverage * equity / price
            };
            let room = match side {
                Side::Buy => max_abs - st.position,
                Side::Sell => max_abs + st.position,
            };
            limit(room, OrderCheckCode::MaxLeverage);
        }

        // caps include uncommitted fills; the planner subtracts them again
        if !st.leveraged {
            match side {
                Side::Buy => {
                    let cost = price * (1.0 + m.fees);
                    limit(st.balance / cost + st.unconfirmed_position, OrderCheckCode::NoFunds);
                }
                Side::Sell => limit(st.position, OrderCheckCode::NoFunds),
            }
        }

        if allowed >= requested {
            return OrderCheck::accepted(requested);
        }
        let code = limited_by.unwrap_or(OrderCheckCode::InvalidSize);
        if allowed < min {
            OrderCheck::rejected(code)
        } else {
            OrderCheck::partial(allowed)
        }
    }

    // ----- requests -----

    pub fn limit_buy(&mut self, price: f64, size: f64) -> OrderCheck {
        let price = round_down_to_step(price, self.market.currency_step);
        self.request(Side::Buy, price, size)
    }

    pub fn limit_sell(&mut self, price: f64, size: f64) -> OrderCheck {
        let price = round_up_to_step(price, self.market.currency_step);
        self.request(Side::Sell, price, size)
    }

    fn request(&mut self, side: Side, price: f64, size: f64) -> OrderCheck {
        let check = self.check_size(side, price, size);
        let order = check
            .code
            .is_accepted()
            .then_some(LimitOrder { price, size: check.size });
        let error = (check.code != OrderCheckCode::Accepted)
            .then(|| OrderError::rejected(check.code, price, size));
        let alert = (check.code == OrderCheckCode::TooSmall).then_some(price);

        match side {
            Side::Buy => {
                self.out.buy = order;
                self.out.buy_error = error;
                self.out.alert_buy = alert;
            }
            Side::Sell => {
                self.out.sell = order;
                self.out.sell_error = error;
                self.out.alert_sell = alert;
            }
        }
        check
    }

    pub fn cancel_buy(&mut self) {
        self.out.buy = None;
        self.out.buy_error = None;
        self.out.alert_buy = None;
    }

    pub fn cancel_sell(&mut self) {
        self.out.sell = None;
        self.out.sell_error = None;
        self.out.alert_sell = None;
    }

    pub fn market_buy(&mut self, size: f64) -> OrderCheck {
        let check = self.check_buy_size(self.state.highest_buy_price, size);
        if check.code.is_accepted() {
            self.out.market_order = Some(check.size);
        } else {
            self.out.buy_error =
                Some(OrderError::rejected(check.code, self.state.highest_buy_price, size));
        }
        check
    }

    pub fn market_sell(&mut self, size: f64) -> OrderCheck {
        let check = self.check_sell_size(self.state.lowest_sell_price, size);
        if check.code.is_accepted() {
            self.out.market_order = Some(-check.size);
        } else {
            self.out.sell_error =
                Some(OrderError::rejected(check.code, self.state.lowest_sell_price, size));
        }
        check
    }

    /// Declare the position changed outside of trading, at `price`.
    pub fn alter_position(&mut self, new_position: f64, price: f64) {
        self.out.alter_position = Some((new_position, price));
    }

    // ----- reporting -----

    pub fn set_equilibrium_price(&mut self, price: f64) {
        self.out.equilibrium = Some(price);
    }

    pub fn set_safe_range(&mut self, min: Option<f64>, max: Option<f64>) {
        self.out.safe_range = Some(SafeRange { min, max });
    }

    pub fn set_equity_allocation(&mut self, equity: f64) {
        self.out.equity_allocation = Some(equity);
    }

    pub fn set_neutral_price(&mut self, price: f64) {
        self.out.neutral_price = Some(price);
    }

    pub fn report(&mut self, title: &str, value: impl Serialize) {
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.out.reports.insert(title.to_string(), value);
    }

    pub fn log(&mut self, text: impl Into<String>) {
        let text = text.into();
        info!(target: "strategy", "{}", text);
        self.out.logs.push(text);
    }
}
