//! Strategy and spread-generator capabilities.
//!
//! Both are immutable values: every update returns the next value instead of
//! mutating in place, so a cycle that fails halfway keeps the previous state.
//!
//! - `constant_ratio`: reference strategy keeping a fixed share of equity in assets
//! - `spread`: reference spread generator with a dynamic multiplier

mod constant_ratio;
mod spread;

pub use constant_ratio::ConstantRatioStrategy;
pub use spread::VolatilitySpreadGenerator;

use crate::config::{SpreadConfig, StrategyConfig};
use crate::trader::Control;
use crate::trading::{MarketState, Side};
use serde::{Deserialize, Serialize};

/// Position and equity a strategy would hold at a given price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub valid: bool,
    pub position: f64,
    pub equity: f64,
}

/// Trading decision maker driven through `Control`.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Inspect the market through `ctl`, request orders, and return the
    /// strategy value for the next cycle.
    fn run(&self, ctl: &mut Control<'_>) -> anyhow::Result<Box<dyn Strategy>>;

    /// Fresh strategy for the post-reset market. An error means the strategy
    /// cannot work from that state and the reset must be retried.
    fn reset(&self, state: &MarketState) -> anyhow::Result<Box<dyn Strategy>>;

    fn save(&self) -> serde_json::Value;

    fn load(&self, blob: &serde_json::Value) -> anyhow::Result<Box<dyn Strategy>>;

    /// Position the strategy would like to hold when starting from `state`.
    fn calc_initial_position(&self, state: &MarketState) -> f64;

    fn chart_point(&self, price: f64) -> ChartPoint;
}

/// Source of quote prices around an equilibrium.
pub trait SpreadGenerator: Send + Sync {
    fn add_point(&self, price: f64) -> Box<dyn SpreadGenerator>;

    fn report_trade(&self, price: f64, size: f64) -> Box<dyn SpreadGenerator>;

    /// Quote price for `side` around `equilibrium`, `None` while the
    /// generator has no opinion.
    fn order_price(&self, side: Side, equilibrium: f64, use_dynmult: bool) -> Option<f64>;

    /// Relative half-spread before the dynamic multiplier.
    fn base_spread(&self) -> f64;

    /// Current (buy, sell) dynamic multipliers.
    fn dyn_mult(&self) -> (f64, f64);

    fn save(&self) -> serde_json::Value;

    fn load(&self, blob: &serde_json::Value) -> anyhow::Result<Box<dyn SpreadGenerator>>;
}

pub fn create_strategy(config: &StrategyConfig) -> Box<dyn Strategy> {
    match config {
        StrategyConfig::ConstantRatio { ratio } => Box::new(ConstantRatioStrategy::new(*ratio)),
    }
}

pub fn create_spread_generator(config: &SpreadConfig) -> Box<dyn SpreadGenerator> {
    Box::new(VolatilitySpreadGenerator::new(config.clone()))
}
