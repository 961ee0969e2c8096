//! Scheduling of trader cycles.
//!
//! - `pool`: bounded worker pool
//! - `traders`: the live trader set, generational replacement and cycles

mod pool;
mod traders;

pub use pool::WorkerPool;
pub use traders::{CommitSummary, Generation, SharedTrader, Traders, Utilization};
