//! Step rounding for exchange quantities.
//!
//! Sizes and prices travel through the engine as `f64`, but rounding them to
//! an asset or currency step is done in decimal so that `0.3 / 0.1` lands on
//! exactly three steps instead of `2.9999999999999996`.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

fn to_decimal(value: f64) -> Option<Decimal> {
    Decimal::from_f64(value)
}

fn apply_step(value: f64, step: f64, op: fn(Decimal) -> Decimal) -> f64 {
    if !value.is_finite() || !step.is_finite() || step <= 0.0 {
        return value;
    }
    match (to_decimal(value), to_decimal(step)) {
        (Some(v), Some(s)) if s > Decimal::ZERO => {
            (op(v / s) * s).to_f64().unwrap_or(value)
        }
        _ => value,
    }
}

/// Round to the nearest multiple of `step` (e.g. a price tick).
pub fn round_to_step(value: f64, step: f64) -> f64 {
    apply_step(value, step, |d| d.round())
}

/// Round toward zero to a multiple of `step` (order sizes).
pub fn round_down_to_step(value: f64, step: f64) -> f64 {
    apply_step(value, step, |d| d.trunc())
}

/// Round away from zero to a multiple of `step` (minimum sizes).
pub fn round_up_to_step(value: f64, step: f64) -> f64 {
    apply_step(value, step, |d| {
        if d.is_sign_negative() {
            d.floor()
        } else {
            d.ceil()
        }
    })
}

/// True when both prices fall on the same tick of `step`.
pub fn same_tick(a: f64, b: f64, step: f64) -> bool {
    if step <= 0.0 || !step.is_finite() {
        return (a - b).abs() <= f64::EPSILON * a.abs().max(b.abs());
    }
    match (to_decimal(a), to_decimal(b), to_decimal(step)) {
        (Some(a), Some(b), Some(s)) => (a / s).round() == (b / s).round(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_to_step() {
        assert_eq!(round_to_step(50123.456, 0.01), 50123.46);
        assert_eq!(round_to_step(50123.456, 0.1), 50123.5);
        assert_eq!(round_to_step(50123.456, 1.0), 50123.0);
    }

    #[test]
    fn test_round_down_to_step() {
        assert_eq!(round_down_to_step(1.567, 0.001), 1.567);
        assert_eq!(round_down_to_step(1.567, 0.01), 1.56);
        assert_eq!(round_down_to_step(0.3, 0.1), 0.3);
        assert_eq!(round_down_to_step(-1.567, 0.1), -1.5);
    }

    #[test]
    fn test_round_up_to_step() {
        assert_eq!(round_up_to_step(0.0101, 0.01), 0.02);
        assert_eq!(round_up_to_step(2.0, 0.5), 2.0);
    }

    #[test]
    fn test_zero_step_is_identity() {
        assert_eq!(round_down_to_step(1.23456, 0.0), 1.23456);
        assert!(same_tick(10.0, 10.0, 0.0));
    }

    #[test]
    fn test_same_tick() {
        assert!(same_tick(100.001, 100.004, 0.01));
        assert!(!same_tick(100.001, 100.011, 0.01));
        // decimal step from a literal behaves like the configured f64 step
        let step = dec!(0.5).to_f64().unwrap();
        assert!(same_tick(10.1, 9.9, step));
    }
}
