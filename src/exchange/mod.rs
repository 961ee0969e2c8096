//! Broker boundary.
//!
//! - `traits`: the `Exchange` capability every broker adapter implements
//! - `types`: broker-neutral tickers, orders, fills and market rules
//! - `paper`: in-memory broker used for paper trading and tests

pub mod paper;
mod traits;
mod types;

pub use paper::{PaperExchange, PaperStats};
pub use traits::{Brokers, Exchange};
#[cfg(test)]
pub use traits::MockExchange;
pub use types::*;
