//! Shared numeric helpers.

pub mod decimal;

pub use decimal::{round_down_to_step, round_to_step, round_up_to_step, same_tick};
