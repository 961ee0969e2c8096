//! Shared wallet bookkeeping.
//!
//! Several traders may trade from the same exchange wallet. `WalletDb`
//! records how much of each symbol every trader claims so that a trader only
//! sees the balance the others have not claimed. `ConflictMap` stops two
//! budget-owning traders from quoting the same pair on the same wallet.

mod conflict;
mod db;

pub use conflict::{ConflictError, ConflictKey, ConflictMap};
pub use db::{Allocation, WalletDb, WalletKey};
