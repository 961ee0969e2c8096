//! Trading data model shared by traders and strategies.
//!
//! - `acb`: average cost basis and PnL accounting
//! - `market_state`: the per-cycle snapshot a strategy sees
//! - `order`: order requests and validation verdicts

mod acb;
mod market_state;
mod order;

pub use acb::Acb;
pub use market_state::{MarketEvent, MarketState};
pub use order::{LimitOrder, OrderCheck, OrderCheckCode, OrderError, ScheduledOrder, Side};
