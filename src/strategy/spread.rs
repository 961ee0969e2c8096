//! Spread from recent price volatility, widened by a dynamic multiplier.
//!
//! A fill on one side raises that side's multiplier so the next quote on the
//! same side sits further away; every new price point decays both
//! multipliers back toward 1.

use super::SpreadGenerator;
use crate::config::SpreadConfig;
use crate::trading::Side;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpreadState {
    /// Natural logarithms of recent prices.
    points: VecDeque<f64>,
    dyn_buy: f64,
    dyn_sell: f64,
}

impl Default for SpreadState {
    fn default() -> Self {
        Self {
            points: VecDeque::new(),
            dyn_buy: 1.0,
            dyn_sell: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VolatilitySpreadGenerator {
    config: SpreadConfig,
    state: SpreadState,
}

impl VolatilitySpreadGenerator {
    pub fn new(config: SpreadConfig) -> Self {
        Self {
            config,
            state: SpreadState::default(),
        }
    }

    fn decay(&self, m: f64) -> f64 {
        1.0 + (m - 1.0) * (1.0 - self.config.dynmult_fall)
    }

    fn raise(&self, m: f64) -> f64 {
        (m * (1.0 + self.config.dynmult_raise)).min(self.config.dynmult_cap)
    }
}

impl SpreadGenerator for VolatilitySpreadGenerator {
    fn add_point(&self, price: f64) -> Box<dyn SpreadGenerator> {
        let mut next = self.clone();
        if price.is_finite() && price > 0.0 {
            next.state.points.push_back(price.ln());
            while next.state.points.len() > self.config.window.max(2) {
                next.state.points.pop_front();
            }
        }
        next.state.dyn_buy = self.decay(self.state.dyn_buy);
        next.state.dyn_sell = self.decay(self.state.dyn_sell);
        Box::new(next)
    }

    fn report_trade(&self, _price: f64, size: f64) -> Box<dyn SpreadGenerator> {
        let mut next = self.clone();
        match Side::of_size(size) {
            Some(Side::Buy) => next.state.dyn_buy = self.raise(self.state.dyn_buy),
            Some(Side::Sell) => next.state.dyn_sell = self.raise(self.state.dyn_sell),
            None => {}
        }
        Box::new(next)
    }

    fn order_price(&self, side: Side, equilibrium: f64, use_dynmult: bool) -> Option<f64> {
        if !equilibrium.is_finite() || equilibrium <= 0.0 {
            return None;
        }
        let mult = match (use_dynmult, side) {
            (false, _) => 1.0,
            (true, Side::Buy) => self.state.dyn_buy,
            (true, Side::Sell) => self.state.dyn_sell,
        };
        let spread = self.base_spread() * mult;
        Some(equilibrium * (-side.sign() * spread).exp())
    }

    fn base_spread(&self) -> f64 {
        let pts = &self.state.points;
        if pts.len() < 2 {
            return self.config.min_spread;
        }
        let moves: f64 = pts
            .iter()
            .zip(pts.iter().skip(1))
            .map(|(a, b)| (b - a).abs())
            .sum();
        let mean = moves / (pts.len() - 1) as f64;
        (mean * self.config.mult).max(self.config.min_spread)
    }

    fn dyn_mult(&self) -> (f64, f64) {
        (self.state.dyn_buy, self.state.dyn_sell)
    }

    fn save(&self) -> serde_json::Value {
        serde_json::to_value(&self.state).unwrap_or(serde_json::Value::Null)
    }

    fn load(&self, blob: &serde_json::Value) -> Result<Box<dyn SpreadGenerator>> {
        if blob.is_null() {
            return Ok(Box::new(self.clone()));
        }
        let state: SpreadState =
            serde_json::from_value(blob.clone()).context("Invalid spread generator state")?;
        Ok(Box::new(Self {
            config: self.config.clone(),
            state,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator() -> VolatilitySpreadGenerator {
        VolatilitySpreadGenerator::new(SpreadConfig {
            window: 10,
            mult: 1.0,
            min_spread: 0.001,
            dynmult_raise: 1.0,
            dynmult_fall: 0.5,
            dynmult_cap: 4.0,
            use_dynmult: true,
        })
    }

    #[test]
    fn test_min_spread_without_history() {
        let g = generator();
        assert_eq!(g.base_spread(), 0.001);
        let buy = g.order_price(Side::Buy, 100.0, false).unwrap();
        let sell = g.order_price(Side::Sell, 100.0, false).unwrap();
        assert!(buy < 100.0 && sell > 100.0);
    }

    #[test]
    fn test_spread_tracks_volatility() {
        let mut g: Box<dyn SpreadGenerator> = Box::new(generator());
        for p in [100.0, 102.0, 100.0, 102.0, 100.0] {
            g = g.add_point(p);
        }
        let expected = (102.0f64 / 100.0).ln();
        assert!((g.base_spread() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_dynmult_raise_and_decay() {
        let g: Box<dyn SpreadGenerator> = Box::new(generator());
        let g = g.report_trade(100.0, 1.0);
        assert_eq!(g.dyn_mult(), (2.0, 1.0));
        let g = g.report_trade(100.0, 1.0).report_trade(100.0, 1.0);
        assert_eq!(g.dyn_mult().0, 4.0); // capped
        let g = g.add_point(100.0);
        assert_eq!(g.dyn_mult(), (2.5, 1.0));
    }

    #[test]
    fn test_save_load_roundtrip_keeps_multipliers() {
        let g: Box<dyn SpreadGenerator> = Box::new(generator());
        let g = g.add_point(100.0).report_trade(100.0, -2.0);
        let restored = generator().load(&g.save()).unwrap();
        assert_eq!(restored.dyn_mult(), g.dyn_mult());
        assert_eq!(restored.base_spread(), g.base_spread());
    }
}
