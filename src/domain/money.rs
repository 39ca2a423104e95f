//! Arbitrary-precision money.
//!
//! The teacher crate this grew from wrapped `rust_decimal::Decimal` in one newtype per known
//! exchange currency (`KrakenAmount`'s nine variants) and panicked when two mismatched variants
//! met in an arithmetic op. That closed set doesn't survive contact with an open, cross-source
//! asset universe, so here there is exactly one newtype, [`Amount`], and asset identity travels
//! alongside it on [`crate::domain::transaction::Movement`] rather than being baked into the
//! type. Arithmetic stays infallible (overflow is a programmer error, not an expected failure),
//! but nothing about *which* asset an `Amount` belongs to is checked here — that's the caller's
//! job, same as it always was one layer up in the teacher.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MoneyError {
    #[error("invalid decimal literal: {0:?}")]
    Parse(String),
}

/// An arbitrary-precision monetary quantity. No currency or asset is attached; see
/// [`crate::domain::asset::AssetId`] and [`crate::domain::asset::Currency`] for that.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Amount(Decimal);

impl Amount {
    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    pub fn from_decimal(d: Decimal) -> Self {
        Self(d)
    }

    pub fn to_decimal(self) -> Decimal {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn is_positive(self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    pub fn abs(self) -> Self {
        Self(self.0.abs())
    }

    pub fn rescale(self, scale: u32) -> Self {
        let mut d = self.0;
        d.rescale(scale);
        Self(d)
    }

    pub fn round_dp(self, dp: u32) -> Self {
        Self(self.0.round_dp(dp))
    }

    /// Multiply by a dimensionless ratio, used by the price-enrichment ratio passes
    /// (trade-ratio derivation, crypto/crypto ratio recalculation).
    pub fn checked_mul(self, other: Self) -> Option<Self> {
        self.0.checked_mul(other.0).map(Self)
    }

    pub fn checked_div(self, other: Self) -> Option<Self> {
        if other.0.is_zero() {
            return None;
        }
        self.0.checked_div(other.0).map(Self)
    }
}

impl FromStr for Amount {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // `Decimal::from_str` already rejects "NaN"/"inf"/garbage with an Err; rust_decimal has
        // no NaN/Inf representation to begin with, so rejecting the parse is sufficient to honor
        // the "parsing rejects NaN/Inf" invariant.
        Decimal::from_str(s)
            .map(Self)
            .map_err(|_| MoneyError::Parse(s.to_string()))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Canonical decimal string: normalize() strips insignificant trailing zeros, and
        // Decimal's Display never uses exponent notation.
        write!(f, "{}", self.0.normalize())
    }
}

impl Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Amount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Neg for Amount {
    type Output = Self;

    fn neg(self) -> Self {
        Self(-self.0)
    }
}

impl From<Decimal> for Amount {
    fn from(d: Decimal) -> Self {
        Self(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_rejects() {
        assert_eq!(Amount::from_str("1.50").unwrap().to_string(), "1.5");
        assert!(Amount::from_str("NaN").is_err());
        assert!(Amount::from_str("Infinity").is_err());
        assert!(Amount::from_str("garbage").is_err());
    }

    #[test]
    fn display_has_no_trailing_zeros_or_exponent() {
        let a = Amount::from_str("100.00000000").unwrap();
        assert_eq!(a.to_string(), "100");
        let b = Amount::from_str("0.00010000").unwrap();
        assert_eq!(b.to_string(), "0.0001");
    }

    #[test]
    fn value_equality_not_lexical() {
        assert_eq!(
            Amount::from_str("1.50").unwrap(),
            Amount::from_str("1.5000").unwrap()
        );
    }

    #[test]
    fn ratio_math_for_enrichment_passes() {
        let outflow_price = Amount::from_str("60000").unwrap();
        let outflow_amount = Amount::from_str("1").unwrap();
        let inflow_amount = Amount::from_str("1000").unwrap();
        let ratio = outflow_amount.checked_div(inflow_amount).unwrap();
        let inflow_price = outflow_price.checked_mul(ratio).unwrap();
        assert_eq!(inflow_price.round_dp(2).to_string(), "60");
    }

    #[test]
    fn arbtest_roundtrip_through_decimal_string() {
        arbtest::arbtest(|u| {
            let cents: i64 = u.arbitrary()?;
            let d = Decimal::new(cents, 2);
            let a = Amount::from_decimal(d);
            let roundtripped: Amount = a.to_string().parse().unwrap();
            assert_eq!(a, roundtripped);
            Ok(())
        });
    }
}
