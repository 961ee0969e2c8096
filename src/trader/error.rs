use crate::wallet::ConflictError;
use thiserror::Error;

/// Failures of a trader that callers may want to match on.
#[derive(Debug, Error)]
pub enum TraderError {
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("invalid ticker for {pair}: bid={bid} ask={ask}")]
    InvalidTicker { pair: String, bid: f64, ask: f64 },

    #[error("trader {0} is not initialized")]
    NotInitialized(String),

    #[error("reset required: {0}")]
    ResetRejected(String),

    #[error("state of {id} is corrupt: {reason}")]
    CorruptState { id: String, reason: String },

    #[error("unknown broker {0}")]
    UnknownBroker(String),
}
