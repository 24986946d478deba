//! Fixed-Point Price/Quantity
//!
//! All prices and quantities in the hot path are signed 64-bit integers
//! scaled by 1e8 (eight fractional digits). The upstream store carries
//! decimal128(38,18) columns; the conversion in is a division by 1e10 that
//! must be exact, the conversion out is a widening multiplication by 1e10.
//! Arithmetic in book updates is limited to checked add/subtract; overflow
//! and precision loss are fatal for the worker.

use crate::recon::error::ReconError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Scale factor: 8 fractional digits.
pub const FP_SCALE: i64 = 100_000_000;

/// Number of fractional digits carried by a [`FixedPoint`].
pub const FP_FRACTIONAL_DIGITS: u32 = 8;

/// Extra scale between FP (1e8) and the sink's decimal128(38,18).
pub const OUTPUT_SCALE_SHIFT: i128 = 10_000_000_000; // 1e10

/// Fixed-point value at scale 1e8.
///
/// `FixedPoint(150_000_000)` is 1.5 in natural units. Equality is integer
/// equality, which makes the type usable directly as a price-level key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FixedPoint(pub i64);

impl FixedPoint {
    pub const ZERO: FixedPoint = FixedPoint(0);

    /// Build from an already-scaled raw value.
    #[inline]
    pub const fn from_raw(raw: i64) -> Self {
        FixedPoint(raw)
    }

    /// Raw scaled value.
    #[inline]
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Build from whole natural units (e.g. `from_int(3)` == 3.0).
    #[inline]
    pub const fn from_int(units: i64) -> Self {
        FixedPoint(units * FP_SCALE)
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Natural-units value as f64 (drift metrics only, never book state).
    #[inline]
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / FP_SCALE as f64
    }

    /// Checked addition. Overflow is fatal upstream.
    #[inline]
    pub fn checked_add(self, other: FixedPoint) -> Result<FixedPoint, ReconError> {
        self.0
            .checked_add(other.0)
            .map(FixedPoint)
            .ok_or(ReconError::ArithmeticOverflow {
                op: "add",
                lhs: self.0,
                rhs: other.0,
            })
    }

    /// Checked subtraction.
    #[inline]
    pub fn checked_sub(self, other: FixedPoint) -> Result<FixedPoint, ReconError> {
        self.0
            .checked_sub(other.0)
            .map(FixedPoint)
            .ok_or(ReconError::ArithmeticOverflow {
                op: "sub",
                lhs: self.0,
                rhs: other.0,
            })
    }

    /// Convert an input decimal128(38,18) value to FP.
    ///
    /// The input scale is 18, ours is 8; the division by 1e10 must be exact,
    /// otherwise the value needs more than 8 fractional digits.
    pub fn from_decimal128_18(value: i128) -> Result<FixedPoint, ReconError> {
        if value % OUTPUT_SCALE_SHIFT != 0 {
            return Err(ReconError::PrecisionLoss {
                value: format_decimal128_18(value),
            });
        }
        let scaled = value / OUTPUT_SCALE_SHIFT;
        i64::try_from(scaled)
            .map(FixedPoint)
            .map_err(|_| ReconError::ArithmeticOverflow {
                op: "narrow",
                lhs: scaled.clamp(i64::MIN as i128, i64::MAX as i128) as i64,
                rhs: 0,
            })
    }

    /// Widen to the sink's decimal128(38,18) representation.
    #[inline]
    pub fn to_decimal128_18(self) -> i128 {
        self.0 as i128 * OUTPUT_SCALE_SHIFT
    }
}

/// Render a raw decimal128(38,18) value for error messages.
fn format_decimal128_18(value: i128) -> String {
    let sign = if value < 0 { "-" } else { "" };
    let abs = value.unsigned_abs();
    let scale = 10u128.pow(18);
    format!("{}{}.{:018}", sign, abs / scale, abs % scale)
}

impl FromStr for FixedPoint {
    type Err = ReconError;

    /// Parse a decimal string (`"101.5"`, `"-0.00000001"`). More than eight
    /// fractional digits is a precision loss unless the excess digits are a
    /// half-even-roundable exact zero tail.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let precision_loss = || ReconError::PrecisionLoss {
            value: s.to_string(),
        };

        let (sign, body) = match s.as_bytes().first() {
            Some(b'-') => (-1i64, &s[1..]),
            Some(b'+') => (1i64, &s[1..]),
            _ => (1i64, s),
        };
        if body.is_empty() {
            return Err(precision_loss());
        }

        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, f),
            None => (body, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(precision_loss());
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(precision_loss());
        }

        // Digits past position 8 must all be zero.
        let (kept, excess) = if frac_part.len() > FP_FRACTIONAL_DIGITS as usize {
            frac_part.split_at(FP_FRACTIONAL_DIGITS as usize)
        } else {
            (frac_part, "")
        };
        if excess.bytes().any(|b| b != b'0') {
            return Err(precision_loss());
        }

        let int_units: i64 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| ReconError::ArithmeticOverflow {
                op: "parse",
                lhs: 0,
                rhs: 0,
            })?
        };

        let mut frac_units: i64 = 0;
        for b in kept.bytes() {
            frac_units = frac_units * 10 + (b - b'0') as i64;
        }
        // Pad to exactly eight digits.
        for _ in kept.len()..FP_FRACTIONAL_DIGITS as usize {
            frac_units *= 10;
        }

        let raw = int_units
            .checked_mul(FP_SCALE)
            .and_then(|v| v.checked_add(frac_units))
            .and_then(|v| v.checked_mul(sign))
            .ok_or(ReconError::ArithmeticOverflow {
                op: "parse",
                lhs: int_units,
                rhs: frac_units,
            })?;

        Ok(FixedPoint(raw))
    }
}

impl fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let int = abs / FP_SCALE as u64;
        let frac = abs % FP_SCALE as u64;
        if frac == 0 {
            write!(f, "{}{}", sign, int)
        } else {
            let mut frac_str = format!("{:08}", frac);
            while frac_str.ends_with('0') {
                frac_str.pop();
            }
            write!(f, "{}{}.{}", sign, int, frac_str)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        assert_eq!("100".parse::<FixedPoint>().unwrap().raw(), 100 * FP_SCALE);
        assert_eq!("100.1".parse::<FixedPoint>().unwrap().raw(), 10_010_000_000);
        assert_eq!("0.00000001".parse::<FixedPoint>().unwrap().raw(), 1);
        assert_eq!("-1.5".parse::<FixedPoint>().unwrap().raw(), -150_000_000);
    }

    #[test]
    fn test_parse_excess_zero_tail_ok() {
        // Trailing zeros beyond eight digits lose nothing.
        assert_eq!(
            "1.2500000000".parse::<FixedPoint>().unwrap().raw(),
            125_000_000
        );
    }

    #[test]
    fn test_parse_precision_loss() {
        let err = "0.000000001".parse::<FixedPoint>().unwrap_err();
        assert!(matches!(err, ReconError::PrecisionLoss { .. }));

        let err = "1.123456789".parse::<FixedPoint>().unwrap_err();
        assert!(matches!(err, ReconError::PrecisionLoss { .. }));
    }

    #[test]
    fn test_parse_garbage() {
        assert!("".parse::<FixedPoint>().is_err());
        assert!(".".parse::<FixedPoint>().is_err());
        assert!("1.2.3".parse::<FixedPoint>().is_err());
        assert!("abc".parse::<FixedPoint>().is_err());
    }

    #[test]
    fn test_decimal128_round_trip() {
        let fp = FixedPoint::from_raw(10_010_000_000); // 100.1
        let wide = fp.to_decimal128_18();
        assert_eq!(wide, 100_100_000_000_000_000_000i128);
        assert_eq!(FixedPoint::from_decimal128_18(wide).unwrap(), fp);
    }

    #[test]
    fn test_decimal128_precision_loss() {
        // One part in 1e18 cannot be represented at scale 1e8.
        let err = FixedPoint::from_decimal128_18(1).unwrap_err();
        assert!(matches!(err, ReconError::PrecisionLoss { .. }));
    }

    #[test]
    fn test_checked_arithmetic() {
        let a = FixedPoint::from_int(1);
        let b = FixedPoint::from_int(2);
        assert_eq!(a.checked_add(b).unwrap(), FixedPoint::from_int(3));
        assert_eq!(b.checked_sub(a).unwrap(), FixedPoint::from_int(1));

        let big = FixedPoint::from_raw(i64::MAX);
        assert!(matches!(
            big.checked_add(FixedPoint::from_raw(1)),
            Err(ReconError::ArithmeticOverflow { .. })
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(FixedPoint::from_raw(10_010_000_000).to_string(), "100.1");
        assert_eq!(FixedPoint::from_int(7).to_string(), "7");
        assert_eq!(FixedPoint::from_raw(1).to_string(), "0.00000001");
        assert_eq!(FixedPoint::from_raw(-150_000_000).to_string(), "-1.5");
    }
}
