//! # mmbot-core
//!
//! Multi-pair market-making engine: many traders share broker wallets,
//! reconcile their books with the broker every cycle and persist their
//! state between runs.
//!
//! ## Architecture
//!
//! - `config`: configuration loading and validation
//! - `exchange`: broker capability trait and the in-memory paper broker
//! - `trading`: market snapshot, average cost basis, order primitives
//! - `strategy`: strategy and spread generator traits with reference models
//! - `wallet`: shared wallet ledger and pair conflict registry
//! - `trader`: the per-pair trading cycle
//! - `engine`: worker pool and the live trader set
//! - `persistence`: SQLite store of trader state documents
//! - `report`: reporting sink
//! - `utils`: step rounding helpers

pub mod config;
pub mod engine;
pub mod exchange;
pub mod persistence;
pub mod report;
pub mod strategy;
pub mod trader;
pub mod trading;
pub mod utils;
pub mod wallet;

pub use config::Config;
