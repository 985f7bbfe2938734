//! Decimal USDC amounts.
//!
//! Prices and spend caps travel as decimal strings to preserve precision, so
//! the crate never touches floating point for money. [`UsdAmount`] accepts
//! human-readable inputs like `"$0.01"` or `"0.25"`, rejects negatives, and
//! serializes back to a plain decimal string.

use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::Add;
use std::str::FromStr;

/// A non-negative USDC amount backed by [`Decimal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UsdAmount(Decimal);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UsdAmountError {
    #[error("invalid amount format")]
    InvalidFormat,
    #[error("negative amount is not allowed")]
    Negative,
    #[error("amount out of range")]
    OutOfRange,
}

static MAX_AMOUNT: Lazy<Decimal> =
    Lazy::new(|| Decimal::from_str("999999999").expect("valid decimal"));

static CURRENCY_NOISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\d.\-]+").expect("valid currency-noise regex"));

impl UsdAmount {
    pub const ZERO: UsdAmount = UsdAmount(Decimal::ZERO);

    /// Parse a human-readable amount, tolerating currency symbols and
    /// thousands separators (`"$0.01"`, `"1,000"`).
    pub fn parse(input: &str) -> Result<Self, UsdAmountError> {
        let cleaned = CURRENCY_NOISE.replace_all(input, "");
        let parsed = Decimal::from_str(&cleaned).map_err(|_| UsdAmountError::InvalidFormat)?;
        if parsed.is_sign_negative() {
            return Err(UsdAmountError::Negative);
        }
        if parsed > *MAX_AMOUNT {
            return Err(UsdAmountError::OutOfRange);
        }
        Ok(UsdAmount(parsed))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Saturating subtraction, clamped at zero. Used by the spend tracker's
    /// settlement-failure rollback.
    pub fn saturating_sub(&self, other: UsdAmount) -> UsdAmount {
        if other.0 >= self.0 {
            UsdAmount::ZERO
        } else {
            UsdAmount(self.0 - other.0)
        }
    }

    /// Dollar-prefixed rendering for 402 bodies, e.g. `$0.01`.
    pub fn as_price_tag(&self) -> String {
        format!("${}", self.0.normalize())
    }
}

impl Default for UsdAmount {
    fn default() -> Self {
        UsdAmount::ZERO
    }
}

impl Add for UsdAmount {
    type Output = UsdAmount;

    fn add(self, rhs: UsdAmount) -> UsdAmount {
        UsdAmount(self.0 + rhs.0)
    }
}

impl From<Decimal> for UsdAmount {
    fn from(value: Decimal) -> Self {
        UsdAmount(value)
    }
}

impl FromStr for UsdAmount {
    type Err = UsdAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UsdAmount::parse(s)
    }
}

impl fmt::Display for UsdAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

impl Serialize for UsdAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for UsdAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        UsdAmount::parse(&s).map_err(serde::de::Error::custom)
    }
}
