//! Quantisation & formatting of prices and quantities to instrument steps.
//!
//! Exact decimal arithmetic throughout — binary floating point never touches
//! a submitted price or quantity. `rust_decimal::Decimal` is a fixed-point
//! base-10 type, so `floor_to_step`/`ceil_to_step` are exact integer-multiple
//! operations, never float division followed by rounding.

use rust_decimal::Decimal;

/// Round `x` down to the nearest multiple of `step` (toward negative infinity
/// is not required here — toward zero is what the exchange wants for prices
/// and quantities, which are always non-negative in this pipeline).
pub fn floor_to_step(x: Decimal, step: Decimal) -> Decimal {
    debug_assert!(step > Decimal::ZERO, "step must be strictly positive");
    let units = (x / step).trunc();
    units * step
}

/// Round `x` up to the nearest multiple of `step`.
pub fn ceil_to_step(x: Decimal, step: Decimal) -> Decimal {
    debug_assert!(step > Decimal::ZERO, "step must be strictly positive");
    let floored = floor_to_step(x, step);
    if floored == x {
        floored
    } else {
        floored + step
    }
}

/// Number of fractional digits implied by `step` (e.g. step=0.0001 -> 4).
pub fn decimals_for_step(step: Decimal) -> u32 {
    step.normalize().scale()
}

/// Format `x` with exactly as many fractional digits as `step` requires.
pub fn format_to_step(x: Decimal, step: Decimal) -> String {
    let dp = decimals_for_step(step);
    let rounded = floor_to_step(x, step);
    format!("{:.*}", dp as usize, rounded)
}

/// True iff `x` is an exact integer multiple of `step`.
pub fn is_multiple_of(x: Decimal, step: Decimal) -> bool {
    step > Decimal::ZERO && (x % step) == Decimal::ZERO
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn floor_rounds_down_to_tick() {
        let tick = d("0.0001");
        assert_eq!(floor_to_step(d("4.99876"), tick), d("4.9987"));
        assert_eq!(floor_to_step(d("4.9990"), tick), d("4.9990"));
    }

    #[test]
    fn ceil_rounds_up_to_tick() {
        let tick = d("0.0001");
        assert_eq!(ceil_to_step(d("4.99871"), tick), d("4.9988"));
        assert_eq!(ceil_to_step(d("4.9990"), tick), d("4.9990"));
    }

    #[test]
    fn format_matches_step_precision() {
        assert_eq!(format_to_step(d("4.9987"), d("0.0001")), "4.9987");
        assert_eq!(format_to_step(d("10"), d("0.01")), "10.00");
        assert_eq!(format_to_step(d("10.125"), d("0.01")), "10.12");
    }

    #[test]
    fn format_round_trip_matches_floor() {
        let step = d("0.01");
        for raw in ["4.999", "10.004", "0.015", "123.456"] {
            let x = d(raw);
            let formatted = format_to_step(x, step);
            let parsed = Decimal::from_str(&formatted).unwrap();
            assert_eq!(parsed, floor_to_step(x, step), "round-trip failed for {raw}");
        }
    }

    #[test]
    fn multiple_of_checks_exact_steps() {
        assert!(is_multiple_of(d("10.00"), d("0.01")));
        assert!(!is_multiple_of(d("10.005"), d("0.01")));
    }
}
