//! Order requests and the result of validating them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Side of the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn of_size(size: f64) -> Option<Side> {
        if size > 0.0 {
            Some(Side::Buy)
        } else if size < 0.0 {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// A price/size pair. Sizes are unsigned here; the side is carried separately.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitOrder {
    pub price: f64,
    pub size: f64,
}

/// An order ready to be sent, possibly replacing a resting one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledOrder {
    pub price: f64,
    /// Signed size.
    pub size: f64,
    pub replace_id: Option<String>,
    pub replace_expected_size: Option<f64>,
}

/// Validation verdict for an order request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderCheckCode {
    Accepted,
    PartiallyAccepted,
    InvalidPrice,
    InvalidSize,
    TooSmall,
    MaxLeverage,
    NoFunds,
    MaxPosition,
    MinPosition,
    MaxCosts,
}

impl OrderCheckCode {
    /// Only accepted and partially accepted requests turn into orders.
    pub fn is_accepted(&self) -> bool {
        matches!(self, OrderCheckCode::Accepted | OrderCheckCode::PartiallyAccepted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderCheckCode::Accepted => "accepted",
            OrderCheckCode::PartiallyAccepted => "partially_accepted",
            OrderCheckCode::InvalidPrice => "invalid_price",
            OrderCheckCode::InvalidSize => "invalid_size",
            OrderCheckCode::TooSmall => "too_small",
            OrderCheckCode::MaxLeverage => "max_leverage",
            OrderCheckCode::NoFunds => "no_funds",
            OrderCheckCode::MaxPosition => "max_position",
            OrderCheckCode::MinPosition => "min_position",
            OrderCheckCode::MaxCosts => "max_costs",
        }
    }
}

impl fmt::Display for OrderCheckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict plus the size that goes forward: the clamped size when accepted,
/// the suggested minimum for `TooSmall`, zero otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderCheck {
    pub code: OrderCheckCode,
    pub size: f64,
}

impl OrderCheck {
    pub fn accepted(size: f64) -> Self {
        Self { code: OrderCheckCode::Accepted, size }
    }

    pub fn partial(size: f64) -> Self {
        Self { code: OrderCheckCode::PartiallyAccepted, size }
    }

    pub fn rejected(code: OrderCheckCode) -> Self {
        Self { code, size: 0.0 }
    }

    pub fn too_small(min_size: f64) -> Self {
        Self { code: OrderCheckCode::TooSmall, size: min_size }
    }
}

/// User-visible reason a side is not quoted as requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderError {
    pub code: OrderCheckCode,
    /// Requested display price and size.
    pub price: f64,
    pub size: f64,
    /// Free text, used for broker placement errors.
    pub message: Option<String>,
}

impl OrderError {
    pub fn rejected(code: OrderCheckCode, price: f64, size: f64) -> Self {
        Self { code, price, size, message: None }
    }

    pub fn placement(price: f64, size: f64, message: impl Into<String>) -> Self {
        Self {
            code: OrderCheckCode::Accepted,
            price,
            size,
            message: Some(message.into()),
        }
    }
}

impl fmt::Display for OrderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{} ({} @ {})", msg, self.size, self.price),
            None => write!(f, "{} ({} @ {})", self.code, self.size, self.price),
        }
    }
}
