//! Configuration for the market-making engine.
//!
//! Loads settings from an optional config file, `.env` and environment
//! variables (`MMB__ENGINE__CYCLE_INTERVAL_SECS=30`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::exchange::{FeeScheme, MarketInfo};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Scheduler and storage settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Paper brokers by name
    #[serde(default)]
    pub paper: BTreeMap<String, PaperBrokerConfig>,
    /// Traders by id
    #[serde(default)]
    pub traders: BTreeMap<String, TraderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between trading cycles
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    /// Traders allowed to run concurrently
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// SQLite file holding trader state
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaperBrokerConfig {
    #[serde(default)]
    pub markets: BTreeMap<String, PaperMarketConfig>,
    /// wallet -> symbol -> starting balance
    #[serde(default)]
    pub balances: BTreeMap<String, BTreeMap<String, f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperMarketConfig {
    pub asset: String,
    pub currency: String,
    #[serde(default = "default_asset_step")]
    pub asset_step: f64,
    #[serde(default = "default_currency_step")]
    pub currency_step: f64,
    #[serde(default)]
    pub min_size: f64,
    #[serde(default)]
    pub min_volume: f64,
    #[serde(default)]
    pub fees: f64,
    /// Leverage offered, 0 for spot
    #[serde(default)]
    pub leverage: f64,
    #[serde(default)]
    pub invert_price: bool,
    #[serde(default = "default_wallet")]
    pub wallet: String,
    /// Starting mid price
    pub price: f64,
    /// Relative distance of bid and ask from the mid price
    #[serde(default = "default_paper_spread")]
    pub spread: f64,
    /// Mid prices replayed one per cycle, then held at the last one
    #[serde(default)]
    pub replay: Vec<f64>,
}

impl PaperMarketConfig {
    pub fn market_info(&self) -> MarketInfo {
        MarketInfo {
            asset_symbol: self.asset.clone(),
            currency_symbol: self.currency.clone(),
            asset_step: self.asset_step,
            currency_step: self.currency_step,
            min_size: self.min_size,
            min_volume: self.min_volume,
            fees: self.fees,
            fee_scheme: FeeScheme::Currency,
            leverage: self.leverage,
            invert_price: self.invert_price,
            wallet_id: self.wallet.clone(),
        }
    }

    /// Bid and ask around `mid`.
    pub fn quote(&self, mid: f64) -> (f64, f64) {
        (mid * (1.0 - self.spread), mid * (1.0 + self.spread))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraderConfig {
    pub broker: String,
    pub pair: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Trade without claiming balance in the shared wallet ledger
    #[serde(default)]
    pub dont_allocate: bool,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub spread: SpreadConfig,
    #[serde(default)]
    pub min_position: Option<f64>,
    #[serde(default)]
    pub max_position: Option<f64>,
    /// Cap on currency spent buying, net of sells
    #[serde(default)]
    pub max_costs: Option<f64>,
    /// 0 disables the leverage check
    #[serde(default)]
    pub max_leverage: f64,
    /// Balances on the account that never belong to this trader
    #[serde(default)]
    pub external_assets: f64,
    #[serde(default)]
    pub external_currency: f64,
    /// Consecutive mismatching cycles before a lost trade is reported
    #[serde(default = "default_lost_trade_cycles")]
    pub lost_trade_cycles: u32,
    #[serde(default)]
    pub reset: Option<ResetConfig>,
}

impl TraderConfig {
    pub fn new(broker: &str, pair: &str) -> Self {
        Self {
            broker: broker.to_string(),
            pair: pair.to_string(),
            enabled: true,
            dont_allocate: false,
            strategy: StrategyConfig::default(),
            spread: SpreadConfig::default(),
            min_position: None,
            max_position: None,
            max_costs: None,
            max_leverage: 0.0,
            external_assets: 0.0,
            external_currency: 0.0,
            lost_trade_cycles: default_lost_trade_cycles(),
            reset: None,
        }
    }
}

/// Manual reset request. Applied once per revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetConfig {
    pub revision: u64,
    /// New position; adopted immediately, or approached by trading in achieve mode
    #[serde(default)]
    pub position: Option<f64>,
    /// Currency budget of the trader
    #[serde(default)]
    pub balance: Option<f64>,
    #[serde(default)]
    pub achieve: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    ConstantRatio {
        #[serde(default = "default_ratio")]
        ratio: f64,
    },
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig::ConstantRatio {
            ratio: default_ratio(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpreadConfig {
    /// Price points used to measure volatility
    #[serde(default = "default_spread_window")]
    pub window: usize,
    #[serde(default = "default_spread_mult")]
    pub mult: f64,
    /// Lower bound of the relative half-spread
    #[serde(default = "default_min_spread")]
    pub min_spread: f64,
    /// Relative raise of a side's multiplier after a fill on that side
    #[serde(default = "default_dynmult_raise")]
    pub dynmult_raise: f64,
    /// Fraction of the excess multiplier removed every cycle
    #[serde(default = "default_dynmult_fall")]
    pub dynmult_fall: f64,
    #[serde(default = "default_dynmult_cap")]
    pub dynmult_cap: f64,
    #[serde(default = "default_true")]
    pub use_dynmult: bool,
}

impl Default for SpreadConfig {
    fn default() -> Self {
        Self {
            window: default_spread_window(),
            mult: default_spread_mult(),
            min_spread: default_min_spread(),
            dynmult_raise: default_dynmult_raise(),
            dynmult_fall: default_dynmult_fall(),
            dynmult_cap: default_dynmult_cap(),
            use_dynmult: true,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: default_cycle_interval(),
            worker_threads: default_worker_threads(),
            db_path: default_db_path(),
        }
    }
}

// Default value functions
fn default_cycle_interval() -> u64 {
    60
}

fn default_worker_threads() -> usize {
    4
}

fn default_db_path() -> String {
    "data/mmbot.db".to_string()
}

fn default_asset_step() -> f64 {
    0.0001
}

fn default_currency_step() -> f64 {
    0.01
}

fn default_wallet() -> String {
    "main".to_string()
}

fn default_paper_spread() -> f64 {
    0.0005
}

fn default_true() -> bool {
    true
}

fn default_lost_trade_cycles() -> u32 {
    3
}

fn default_ratio() -> f64 {
    0.5
}

fn default_spread_window() -> usize {
    30
}

fn default_spread_mult() -> f64 {
    1.0
}

fn default_min_spread() -> f64 {
    0.002 // 0.2%
}

fn default_dynmult_raise() -> f64 {
    0.5
}

fn default_dynmult_fall() -> f64 {
    0.1
}

fn default_dynmult_cap() -> f64 {
    5.0
}

impl Config {
    /// Load configuration from `.env`, the config file and environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name("mmbot").required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix("MMB").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        Ok(config.normalize())
    }

    /// Table keys come back lowercased, so pairs are matched in upper case.
    fn normalize(mut self) -> Self {
        for broker in self.paper.values_mut() {
            broker.markets = std::mem::take(&mut broker.markets)
                .into_iter()
                .map(|(pair, m)| (pair.to_uppercase(), m))
                .collect();
        }
        for t in self.traders.values_mut() {
            t.pair = t.pair.to_uppercase();
        }
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.engine.worker_threads >= 1,
            "worker_threads must be at least 1"
        );
        anyhow::ensure!(
            self.engine.cycle_interval_secs >= 1,
            "cycle_interval_secs must be at least 1"
        );

        for (name, broker) in &self.paper {
            for (pair, m) in &broker.markets {
                anyhow::ensure!(
                    m.price > 0.0 && m.asset_step > 0.0 && m.currency_step > 0.0,
                    "paper market {}/{} needs a positive price and steps",
                    name,
                    pair
                );
                anyhow::ensure!(
                    m.spread >= 0.0 && m.spread < 1.0,
                    "paper market {}/{} spread must be between 0 and 1",
                    name,
                    pair
                );
            }
        }

        for (id, t) in &self.traders {
            t.validate().with_context(|| format!("Invalid trader {}", id))?;
            let broker = self
                .paper
                .get(&t.broker)
                .with_context(|| format!("Trader {} uses unknown broker {}", id, t.broker))?;
            anyhow::ensure!(
                broker.markets.contains_key(&t.pair),
                "Trader {} trades {} which broker {} does not list",
                id,
                t.pair,
                t.broker
            );
        }
        Ok(())
    }
}

impl TraderConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.pair.is_empty(), "pair must not be empty");
        anyhow::ensure!(self.max_leverage >= 0.0, "max_leverage must not be negative");
        anyhow::ensure!(self.lost_trade_cycles >= 1, "lost_trade_cycles must be at least 1");
        if let (Some(min), Some(max)) = (self.min_position, self.max_position) {
            anyhow::ensure!(min <= max, "min_position must not exceed max_position");
        }
        let StrategyConfig::ConstantRatio { ratio } = self.strategy;
        anyhow::ensure!(ratio > 0.0 && ratio <= 1.0, "ratio must be in (0, 1]");
        anyhow::ensure!(
            self.spread.min_spread > 0.0 && self.spread.dynmult_cap >= 1.0,
            "spread needs a positive min_spread and dynmult_cap >= 1"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.spread.dynmult_fall),
            "dynmult_fall must be between 0 and 1"
        );
        Ok(())
    }
}
