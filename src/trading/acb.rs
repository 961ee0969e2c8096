//! Average cost basis.
//!
//! `Acb` tracks open price, position and realized PnL without rescanning the
//! trade history. It is a value type: applying a trade returns a new `Acb`.
//!
//! On inverted markets prices are quoted as assets per currency, so the
//! accumulated sum is `Σ size/price` and PnL is measured on reciprocals.

use serde::{Deserialize, Serialize};

/// Relative tolerance under which a trade is treated as closing exactly.
const CLOSE_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Acb {
    inverted: bool,
    sum: f64,
    pos: f64,
    rpnl: f64,
}

impl Acb {
    /// Start from an existing position opened at `price`.
    pub fn new(price: f64, pos: f64, inverted: bool) -> Self {
        let mut acb = Self {
            inverted,
            sum: 0.0,
            pos: 0.0,
            rpnl: 0.0,
        };
        if pos != 0.0 && price.is_finite() && price > 0.0 {
            acb.sum = acb.contribution(price, pos);
            acb.pos = pos;
        }
        acb
    }

    /// Empty basis (no position).
    pub fn empty(inverted: bool) -> Self {
        Self::new(0.0, 0.0, inverted)
    }

    fn contribution(&self, price: f64, size: f64) -> f64 {
        if self.inverted {
            size / price
        } else {
            size * price
        }
    }

    fn pnl_per_unit(&self, open: f64, price: f64) -> f64 {
        if self.inverted {
            1.0 / open - 1.0 / price
        } else {
            price - open
        }
    }

    /// Apply a fill of `size` at `price`.
    pub fn execution(&self, price: f64, size: f64) -> Acb {
        if size == 0.0 || !size.is_finite() || !price.is_finite() || price <= 0.0 {
            return *self;
        }

        let mut size = size;
        if (self.pos + size).abs() < (self.pos.abs() + size.abs()) * CLOSE_TOLERANCE {
            size = -self.pos;
        }

        if self.pos == 0.0 || self.pos.signum() == size.signum() {
            return Acb {
                sum: self.sum + self.contribution(price, size),
                pos: self.pos + size,
                ..*self
            };
        }

        if size.abs() <= self.pos.abs() {
            let open = self.raw_open_price();
            let new_pos = self.pos + size;
            let closed = -size;
            let (sum, pos) = if new_pos == 0.0 {
                (0.0, 0.0)
            } else {
                (self.sum * new_pos / self.pos, new_pos)
            };
            return Acb {
                sum,
                pos,
                rpnl: self.rpnl + closed * self.pnl_per_unit(open, price),
                ..*self
            };
        }

        // flip: close the whole position, then open the remainder
        self.execution(price, -self.pos)
            .execution(price, size + self.pos)
    }

    fn raw_open_price(&self) -> f64 {
        if self.inverted {
            self.pos / self.sum
        } else {
            self.sum / self.pos
        }
    }

    /// Average open price, `None` when flat.
    pub fn open_price(&self) -> Option<f64> {
        (self.pos != 0.0).then(|| self.raw_open_price())
    }

    pub fn position(&self) -> f64 {
        self.pos
    }

    pub fn rpnl(&self) -> f64 {
        self.rpnl
    }

    pub fn is_inverted(&self) -> bool {
        self.inverted
    }

    /// Unrealized PnL at `price`.
    pub fn upnl(&self, price: f64) -> f64 {
        if self.pos == 0.0 {
            return 0.0;
        }
        if self.inverted {
            self.sum - self.pos / price
        } else {
            self.pos * price - self.sum
        }
    }

    /// Realized plus unrealized PnL at `price`.
    pub fn equity(&self, price: f64) -> f64 {
        self.rpnl + self.upnl(price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn test_accumulate_same_direction() {
        let acb = Acb::empty(false).execution(10.0, 2.0).execution(20.0, 2.0);
        assert_eq!(acb.position(), 4.0);
        assert_close(acb.open_price().unwrap(), 15.0);
        assert_eq!(acb.rpnl(), 0.0);
    }

    #[test]
    fn test_partial_close_realizes_fraction() {
        let acb = Acb::empty(false).execution(10.0, 4.0).execution(15.0, -1.0);
        assert_close(acb.rpnl(), 5.0);
        assert_close(acb.position(), 3.0);
        assert_close(acb.open_price().unwrap(), 10.0);
    }

    #[test]
    fn test_flip_closes_then_reopens() {
        let acb = Acb::new(10.0, 0.0, false)
            .execution(10.0, 5.0)
            .execution(12.0, -8.0);
        assert_close(acb.rpnl(), 10.0);
        assert_close(acb.position(), -3.0);
        assert_close(acb.open_price().unwrap(), 12.0);
    }

    #[test]
    fn test_rounding_dust_closes_exactly() {
        let pos = 0.1 + 0.2; // 0.30000000000000004
        let acb = Acb::empty(false).execution(100.0, pos).execution(101.0, -0.3);
        assert_eq!(acb.position(), 0.0);
        assert_eq!(acb.open_price(), None);
        assert_eq!(acb.upnl(150.0), 0.0);
    }

    #[test]
    fn test_equity_identity_normal_and_inverted() {
        let trades = [
            (100.0, 1.0),
            (110.0, 2.0),
            (105.0, -1.5),
            (95.0, -3.0),
            (90.0, 0.5),
            (120.0, 2.0),
            (118.0, -1.0),
        ];
        for inverted in [false, true] {
            let mut acb = Acb::new(100.0, 0.5, inverted);
            for (price, size) in trades {
                let before = acb.equity(price);
                acb = acb.execution(price, size);
                // trading at the mark price never changes equity
                assert_close(acb.equity(price), before);
                for mark in [80.0, 100.0, 130.0] {
                    assert_close(acb.equity(mark), acb.rpnl() + acb.upnl(mark));
                }
            }
        }
    }

    #[test]
    fn test_inverted_open_price_is_harmonic() {
        let acb = Acb::empty(true).execution(100.0, 1.0).execution(200.0, 1.0);
        // 2 / (1/100 + 1/200)
        assert_close(acb.open_price().unwrap(), 2.0 / 0.015);
        let closed = acb.execution(150.0, -2.0);
        assert_eq!(closed.position(), 0.0);
        assert_close(closed.rpnl(), 2.0 * (0.015 / 2.0 - 1.0 / 150.0));
    }

    #[test]
    fn test_invalid_price_is_ignored() {
        let acb = Acb::empty(false).execution(10.0, 1.0);
        assert_eq!(acb.execution(f64::NAN, 1.0), acb);
        assert_eq!(acb.execution(-5.0, 1.0), acb);
        assert_eq!(acb.execution(10.0, 0.0), acb);
    }
}
