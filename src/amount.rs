//! Arbitrary-precision integer wrapper for value/gas comparisons.
//!
//! spec §9 is explicit: 64-bit integers must not be used for `value` or
//! gas-price comparisons. Everything that crosses the wire as a
//! `0x`-prefixed hex string (or a decimal string, per the filter-rule
//! shape in spec §6) is parsed into [`Amount`].

use num_bigint::BigInt;
use num_traits::Num;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// An arbitrary-precision non-negative quantity (wei, gas units, block
/// numbers used in numeric comparisons, etc).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(BigInt);

impl Amount {
    pub fn zero() -> Self {
        Amount(BigInt::from(0))
    }

    pub fn from_u64(v: u64) -> Self {
        Amount(BigInt::from(v))
    }

    /// Parse a `0x`-prefixed hex string (the wire format for quantities).
    pub fn from_hex(s: &str) -> Result<Self, ParseAmountError> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let stripped = if stripped.is_empty() { "0" } else { stripped };
        BigInt::from_str_radix(stripped, 16)
            .map(Amount)
            .map_err(|_| ParseAmountError(s.to_string()))
    }

    /// Parse either a `0x`-prefixed hex string or a plain decimal string.
    /// Filter-rule literal values (spec §6) are plain strings to preserve
    /// precision; they may be given in either base.
    pub fn from_str_flexible(s: &str) -> Result<Self, ParseAmountError> {
        if s.starts_with("0x") || s.starts_with("0X") {
            Self::from_hex(s)
        } else {
            BigInt::from_str(s)
                .map(Amount)
                .map_err(|_| ParseAmountError(s.to_string()))
        }
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", self.0.to_str_radix(16))
    }

    pub fn cmp_amount(&self, other: &Amount) -> Ordering {
        self.0.cmp(&other.0)
    }

    pub fn add(&self, other: &Amount) -> Amount {
        Amount(&self.0 + &other.0)
    }

    /// Integer division by a sample count, for averaging a window of
    /// amounts without losing precision to `f64`.
    pub fn div_usize(&self, n: usize) -> Amount {
        if n == 0 {
            return Amount::zero();
        }
        Amount(&self.0 / BigInt::from(n))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_flexible(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid numeric amount: {0}")]
pub struct ParseAmountError(String);

/// Parse a `0x`-prefixed hex string into a `u64`, for fields that are
/// genuinely bounded (block numbers, timestamps, gas limits) rather than
/// open-ended value/gas-price quantities.
pub fn parse_hex_u64(hex_str: &str) -> Result<u64, ParseAmountError> {
    let stripped = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    let stripped = if stripped.is_empty() { "0" } else { stripped };
    u64::from_str_radix(stripped, 16).map_err(|_| ParseAmountError(hex_str.to_string()))
}

/// Format a `u64` as a `0x`-prefixed hex string (the inverse of
/// [`parse_hex_u64`]).
pub fn format_hex_u64(value: u64) -> String {
    format!("0x{:x}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_amount() {
        let a = Amount::from_hex("0x2386f26fc10000").unwrap();
        assert_eq!(a.to_hex(), "0x2386f26fc10000");
    }

    #[test]
    fn parses_decimal_amount() {
        let a = Amount::from_str_flexible("1000000000000000000").unwrap();
        let b = Amount::from_hex("0xde0b6b3a7640000").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn compares_across_magnitudes_beyond_u64() {
        // larger than u64::MAX
        let big = Amount::from_hex("0xffffffffffffffffff").unwrap();
        let small = Amount::from_u64(u64::MAX);
        assert_eq!(big.cmp_amount(&small), Ordering::Greater);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Amount::from_str_flexible("not-a-number").is_err());
    }

    #[test]
    fn hex_u64_roundtrip() {
        assert_eq!(parse_hex_u64("0x10").unwrap(), 16);
        assert_eq!(format_hex_u64(16), "0x10");
    }
}
