//! Fixed-point progress arithmetic
//!
//! Progress ratios are computed with scaled-integer arithmetic that only ever
//! rounds down, never with floating point. Each checkpoint's ratio is
//! `estimate / total` truncated to six decimal places; the final checkpoint
//! in an execution list absorbs the residual so the ratios sum to exactly
//! one. Displayed progress can therefore lag true completion by up to the
//! rounding epsilon until the last checkpoint lands, and it never overshoots
//! 100% early.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Fractional digits carried by [`Fraction`]
const FRACTION_DIGITS: u32 = 6;

/// Scaling factor: one whole unit in fixed-point representation
const SCALE: u64 = 10u64.pow(FRACTION_DIGITS);

/// A non-negative fixed-point fraction with six decimal digits
///
/// All arithmetic truncates toward zero. Values are plain scaled integers,
/// so equality and summation are exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fraction(u64);

impl Fraction {
    /// Zero
    pub const ZERO: Fraction = Fraction(0);

    /// Exactly one
    pub const ONE: Fraction = Fraction(SCALE);

    /// Build `numerator / denominator`, truncated
    ///
    /// A zero denominator yields zero rather than a panic; callers guarantee
    /// non-empty execution lists before dividing.
    pub fn ratio(numerator: u64, denominator: u64) -> Fraction {
        if denominator == 0 {
            return Fraction::ZERO;
        }
        let scaled = (numerator as u128 * SCALE as u128) / denominator as u128;
        Fraction(scaled.min(u64::MAX as u128) as u64)
    }

    /// Scale by a percentage in `0..=100`, truncated
    pub fn scale_percent(self, percent: u8) -> Fraction {
        let percent = percent.min(100) as u128;
        Fraction(((self.0 as u128 * percent) / 100) as u64)
    }

    /// Whole-number percentage this fraction represents, truncated
    pub fn as_percent(self) -> u8 {
        ((self.0 as u128 * 100) / SCALE as u128) as u8
    }

    /// Raw scaled value (units of 10^-6)
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl Add for Fraction {
    type Output = Fraction;

    fn add(self, rhs: Fraction) -> Fraction {
        Fraction(self.0 + rhs.0)
    }
}

impl AddAssign for Fraction {
    fn add_assign(&mut self, rhs: Fraction) {
        self.0 += rhs.0;
    }
}

impl Sub for Fraction {
    type Output = Fraction;

    fn sub(self, rhs: Fraction) -> Fraction {
        Fraction(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / SCALE, self.0 % SCALE)
    }
}

/// Compute per-checkpoint ratios for an execution list
///
/// Every estimate is truncated against the total; the last entry receives
/// the residual `1 - sum(others)` so the ratios sum to exactly
/// [`Fraction::ONE`]. Estimates are expected to be pre-clamped to at least 1.
pub fn compute_ratios(estimates: &[u32]) -> Vec<Fraction> {
    if estimates.is_empty() {
        return Vec::new();
    }

    let total: u64 = estimates.iter().map(|&e| e as u64).sum();
    let mut ratios: Vec<Fraction> = estimates[..estimates.len() - 1]
        .iter()
        .map(|&e| Fraction::ratio(e as u64, total))
        .collect();

    let assigned = ratios
        .iter()
        .fold(Fraction::ZERO, |acc, &r| acc + r);
    ratios.push(Fraction::ONE - assigned);
    ratios
}

/// Monotonic accumulator for overall session progress
///
/// Advances only when a checkpoint fully completes; mid-checkpoint progress
/// is derived from the running checkpoint's self-reported percentage without
/// touching the accumulated base.
#[derive(Debug, Default)]
pub struct ProgressAggregator {
    completed: Fraction,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a completed checkpoint's ratio into the base
    pub fn complete(&mut self, ratio: Fraction) {
        self.completed += ratio;
    }

    /// Accumulated fraction of the session that has fully completed
    pub fn completed(&self) -> Fraction {
        self.completed
    }

    /// Overall fraction including the running checkpoint's partial progress
    pub fn overall(&self, running_ratio: Fraction, reported_percent: u8) -> Fraction {
        self.completed + running_ratio.scale_percent(reported_percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_scenario_a_exact_ratios() {
        // Estimates 10, 5, 5: ratios are exactly 0.5, 0.25, 0.25.
        let ratios = compute_ratios(&[10, 5, 5]);
        assert_eq!(ratios[0], Fraction::ratio(1, 2));
        assert_eq!(ratios[1], Fraction::ratio(1, 4));
        assert_eq!(ratios[2], Fraction::ratio(1, 4));

        let sum = ratios.iter().fold(Fraction::ZERO, |acc, &r| acc + r);
        assert_eq!(sum, Fraction::ONE);
    }

    #[test]
    fn test_residual_absorbs_rounding() {
        // 1/3 truncates to 0.333333; the last entry picks up the leftover.
        let ratios = compute_ratios(&[1, 1, 1]);
        assert_eq!(ratios[0].raw(), 333_333);
        assert_eq!(ratios[1].raw(), 333_333);
        assert_eq!(ratios[2].raw(), 333_334);
    }

    #[test]
    fn test_single_checkpoint_gets_everything() {
        assert_eq!(compute_ratios(&[7]), vec![Fraction::ONE]);
    }

    #[test]
    fn test_empty_list() {
        assert!(compute_ratios(&[]).is_empty());
    }

    #[test]
    fn test_scale_percent_truncates() {
        let third = Fraction::ratio(1, 3);
        // 0.333333 * 50% = 0.1666665 -> truncated to 0.166666
        assert_eq!(third.scale_percent(50).raw(), 166_666);
        assert_eq!(third.scale_percent(0), Fraction::ZERO);
        assert_eq!(third.scale_percent(100), third);
    }

    #[test]
    fn test_aggregator_never_overshoots() {
        let ratios = compute_ratios(&[3, 3, 3]);
        let mut agg = ProgressAggregator::new();

        agg.complete(ratios[0]);
        agg.complete(ratios[1]);
        // Two thirds done, last checkpoint at 99%: still strictly below one.
        assert!(agg.overall(ratios[2], 99) < Fraction::ONE);

        agg.complete(ratios[2]);
        assert_eq!(agg.completed(), Fraction::ONE);
        assert_eq!(agg.completed().as_percent(), 100);
    }

    #[test]
    fn test_display() {
        assert_eq!(Fraction::ratio(1, 4).to_string(), "0.250000");
        assert_eq!(Fraction::ONE.to_string(), "1.000000");
    }

    proptest! {
        #[test]
        fn prop_ratios_sum_to_exactly_one(
            estimates in prop::collection::vec(1u32..=10_000, 1..64)
        ) {
            let ratios = compute_ratios(&estimates);
            let sum = ratios.iter().fold(Fraction::ZERO, |acc, &r| acc + r);
            prop_assert_eq!(sum, Fraction::ONE);
            for r in &ratios {
                prop_assert!(*r <= Fraction::ONE);
            }
        }
    }
}
