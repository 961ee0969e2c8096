//! Keeps a constant share of equity invested in the asset.
//!
//! With ratio `r`, equilibrium price `p0` and equity `e0` at that price, the
//! continuously rebalanced position at price `p` is
//! `r * e0 / p0 * (p0 / p)^(1 - r)` and equity grows as `e0 * (p / p0)^r`.

use super::{ChartPoint, Strategy};
use crate::trader::Control;
use crate::trading::{MarketEvent, MarketState};
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Anchor {
    price: f64,
    equity: f64,
}

#[derive(Debug, Clone)]
pub struct ConstantRatioStrategy {
    ratio: f64,
    anchor: Option<Anchor>,
}

impl ConstantRatioStrategy {
    pub fn new(ratio: f64) -> Self {
        Self { ratio, anchor: None }
    }

    fn position_at(&self, anchor: &Anchor, price: f64) -> f64 {
        self.ratio * anchor.equity / anchor.price * (anchor.price / price).powf(1.0 - self.ratio)
    }

    fn equity_at(&self, anchor: &Anchor, price: f64) -> f64 {
        anchor.equity * (price / anchor.price).powf(self.ratio)
    }

    fn anchor_from(state: &MarketState) -> Option<Anchor> {
        (state.cur_price > 0.0 && state.equity > 0.0).then_some(Anchor {
            price: state.cur_price,
            equity: state.equity,
        })
    }
}

impl Strategy for ConstantRatioStrategy {
    fn name(&self) -> &str {
        "constant_ratio"
    }

    fn run(&self, ctl: &mut Control<'_>) -> Result<Box<dyn Strategy>> {
        let state = ctl.state().clone();
        let mut anchor = match self.anchor {
            Some(a) => a,
            None => Self::anchor_from(&state).context("No equity to trade with")?,
        };

        if state.event == MarketEvent::Trade && state.last_trade_price > 0.0 {
            anchor = Anchor {
                price: state.last_trade_price,
                equity: self.equity_at(&anchor, state.last_trade_price),
            };
        }

        ctl.set_equilibrium_price(anchor.price);
        ctl.set_neutral_price(anchor.price);
        ctl.set_equity_allocation(self.equity_at(&anchor, state.cur_price));
        ctl.set_safe_range(None, None);

        let buy_price = state.sug_buy_price;
        let buy_size = self.position_at(&anchor, buy_price) - state.position;
        if buy_size > 0.0 {
            ctl.limit_buy(buy_price, buy_size);
        } else {
            ctl.cancel_buy();
        }

        let sell_price = state.sug_sell_price;
        let sell_size = state.position - self.position_at(&anchor, sell_price);
        if sell_size > 0.0 {
            ctl.limit_sell(sell_price, sell_size);
        } else {
            ctl.cancel_sell();
        }

        ctl.report("ratio", self.ratio);
        Ok(Box::new(Self {
            ratio: self.ratio,
            anchor: Some(anchor),
        }))
    }

    fn reset(&self, state: &MarketState) -> Result<Box<dyn Strategy>> {
        ensure!(
            self.ratio > 0.0 && self.ratio <= 1.0,
            "ratio {} outside (0, 1]",
            self.ratio
        );
        let anchor = Self::anchor_from(state).context("Equity must be positive after reset")?;
        Ok(Box::new(Self {
            ratio: self.ratio,
            anchor: Some(anchor),
        }))
    }

    fn save(&self) -> serde_json::Value {
        serde_json::json!({ "ratio": self.ratio, "anchor": self.anchor })
    }

    fn load(&self, blob: &serde_json::Value) -> Result<Box<dyn Strategy>> {
        if blob.is_null() {
            return Ok(Box::new(self.clone()));
        }
        let anchor: Option<Anchor> = serde_json::from_value(blob["anchor"].clone())
            .context("Invalid constant_ratio state")?;
        Ok(Box::new(Self {
            ratio: self.ratio,
            anchor,
        }))
    }

    fn calc_initial_position(&self, state: &MarketState) -> f64 {
        if state.cur_price <= 0.0 {
            return 0.0;
        }
        self.ratio * state.equity / state.cur_price
    }

    fn chart_point(&self, price: f64) -> ChartPoint {
        match &self.anchor {
            Some(a) if price > 0.0 => ChartPoint {
                valid: true,
                position: self.position_at(a, price),
                equity: self.equity_at(a, price),
            },
            _ => ChartPoint {
                valid: false,
                position: 0.0,
                equity: 0.0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_position_is_ratio_of_equity() {
        let s = ConstantRatioStrategy::new(0.5);
        let st = MarketState::sample(100.0, 0.0, 1000.0);
        assert_eq!(s.calc_initial_position(&st), 5.0);
    }

    #[test]
    fn test_chart_point_follows_anchor() {
        let s = ConstantRatioStrategy::new(0.5);
        let st = MarketState::sample(100.0, 5.0, 500.0);
        let s = s.reset(&st).unwrap();
        let at = s.chart_point(100.0);
        assert!(at.valid);
        assert!((at.position - 5.0).abs() < 1e-12);
        assert!((at.equity - 1000.0).abs() < 1e-9);
        // a lower price means a larger position
        assert!(s.chart_point(81.0).position > 5.0);
    }

    #[test]
    fn test_reset_rejects_empty_account() {
        let s = ConstantRatioStrategy::new(0.5);
        let st = MarketState::sample(100.0, 0.0, 0.0);
        assert!(s.reset(&st).is_err());
    }

    #[test]
    fn test_save_load_keeps_anchor() {
        let s = ConstantRatioStrategy::new(0.3);
        let s = s.reset(&MarketState::sample(50.0, 1.0, 100.0)).unwrap();
        let blob = s.save();
        let restored = ConstantRatioStrategy::new(0.3).load(&blob).unwrap();
        assert_eq!(restored.chart_point(60.0), s.chart_point(60.0));
    }
}
