//! Fixed-point decimal support
//!
//! Every monetary quantity inside the trading core is a `u64` scaled by a
//! per-coin power of ten: prices by `10^quote_precision`, amounts by
//! `10^base_precision`. Decimal strings only exist at the edges (config,
//! API, reporting) and are converted here with `rust_decimal`.
//!
//! Products of two scaled values are computed in `u128` and floor-rounded
//! back into `u64`; anything that does not fit is an [`Error::Overflow`].

use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::{Error, Result};

/// Denominator of relative values (fees, tp/sl offsets, trailing percentages).
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Largest supported coin precision.
pub const MAX_PRECISION: u32 = 18;

/// `10^precision` as a scale factor.
pub fn pow10(precision: u32) -> Result<u64> {
    if precision > MAX_PRECISION {
        return Err(Error::invalid_input(format!(
            "precision {} exceeds maximum {}",
            precision, MAX_PRECISION
        )));
    }
    Ok(10u64.pow(precision))
}

/// Parse a decimal string into a scaled integer.
///
/// Rejects negative values and values carrying more fractional digits than
/// `precision` (trailing zeros are ignored).
pub fn to_scaled(value: &str, precision: u32) -> Result<u64> {
    let scale = pow10(precision)?;
    let parsed = Decimal::from_str(value.trim())
        .map_err(|e| Error::invalid_amount(format!("'{}': {}", value, e)))?;

    if parsed.is_sign_negative() && !parsed.is_zero() {
        return Err(Error::invalid_amount(format!("'{}' is negative", value)));
    }
    if parsed.normalize().scale() > precision {
        return Err(Error::invalid_amount(format!(
            "'{}' has more than {} decimal places",
            value, precision
        )));
    }

    parsed
        .checked_mul(Decimal::from(scale))
        .and_then(|scaled| scaled.trunc().to_u64())
        .ok_or_else(|| Error::overflow(format!("'{}' at precision {}", value, precision)))
}

/// Render a scaled integer as a decimal string with exactly `precision` places.
pub fn from_scaled(value: u64, precision: u32) -> String {
    match Decimal::try_from_i128_with_scale(value as i128, precision) {
        Ok(d) => d.to_string(),
        Err(_) => value.to_string(),
    }
}

/// Quote value of `amount` base units at `price`: `price * amount / 10^base_precision`.
pub fn quote_amount(price: u64, amount: u64, base_precision: u32) -> Result<u64> {
    let scale = pow10(base_precision)? as u128;
    let value = (price as u128) * (amount as u128) / scale;
    u64::try_from(value).map_err(|_| {
        Error::overflow(format!("quote value of {} x {}", price, amount))
    })
}

/// Base units purchasable with `funds` quote units at `price` (floor).
pub fn base_for_quote(funds: u64, price: u64, base_precision: u32) -> Result<u64> {
    if price == 0 {
        return Err(Error::invalid_input("price must be positive"));
    }
    let scale = pow10(base_precision)? as u128;
    let value = (funds as u128) * scale / (price as u128);
    Ok(u64::try_from(value).unwrap_or(u64::MAX))
}

/// `value * bps / 10 000`, floor-rounded.
pub fn apply_bps(value: u64, bps: u64) -> Result<u64> {
    let out = (value as u128) * (bps as u128) / (BPS_DENOMINATOR as u128);
    u64::try_from(out).map_err(|_| Error::overflow(format!("{} bps of {}", bps, value)))
}

/// `value * (1 + bps / 10 000)`.
pub fn add_bps(value: u64, bps: u64) -> Result<u64> {
    value
        .checked_add(apply_bps(value, bps)?)
        .ok_or_else(|| Error::overflow(format!("{} plus {} bps", value, bps)))
}

/// `value * (1 - bps / 10 000)`, zero when `bps` is 10 000 or more.
pub fn sub_bps(value: u64, bps: u64) -> Result<u64> {
    Ok(value.saturating_sub(apply_bps(value, bps)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_to_scaled() {
        assert_eq!(to_scaled("30000.00", 2).unwrap(), 3_000_000);
        assert_eq!(to_scaled("0.5", 4).unwrap(), 5_000);
        assert_eq!(to_scaled("1", 8).unwrap(), 100_000_000);
        assert_eq!(to_scaled("0.10000", 4).unwrap(), 1_000);
        assert_eq!(to_scaled(" 2.5 ", 1).unwrap(), 25);
    }

    #[test]
    fn test_to_scaled_rejects_bad_input() {
        assert!(matches!(to_scaled("-1", 2), Err(Error::InvalidAmount(_))));
        assert!(matches!(to_scaled("0.001", 2), Err(Error::InvalidAmount(_))));
        assert!(matches!(to_scaled("abc", 2), Err(Error::InvalidAmount(_))));
        assert!(matches!(
            to_scaled("99999999999999999999", 2),
            Err(Error::Overflow(_))
        ));
        assert!(to_scaled("1", 19).is_err());
    }

    #[test]
    fn test_from_scaled() {
        assert_eq!(from_scaled(3_000_000, 2), "30000.00");
        assert_eq!(from_scaled(5_000, 4), "0.5000");
        assert_eq!(from_scaled(0, 2), "0.00");
        assert_eq!(from_scaled(7, 0), "7");
    }

    #[test]
    fn test_quote_amount() {
        // 30000.00 x 0.5000 = 15000.00
        assert_eq!(quote_amount(3_000_000, 5_000, 4).unwrap(), 1_500_000);
        // 0.03 x 0.5 at base precision 1 floors to 0.01
        assert_eq!(quote_amount(3, 5, 1).unwrap(), 1);
        assert!(matches!(
            quote_amount(u64::MAX, u64::MAX, 0),
            Err(Error::Overflow(_))
        ));
    }

    #[test]
    fn test_base_for_quote() {
        // 15000.00 buys 0.5000 at 30000.00
        assert_eq!(base_for_quote(1_500_000, 3_000_000, 4).unwrap(), 5_000);
        assert!(base_for_quote(1, 0, 4).is_err());
    }

    #[test]
    fn test_bps() {
        assert_eq!(apply_bps(1_000_000, 25).unwrap(), 2_500);
        assert_eq!(add_bps(10_000, 500).unwrap(), 10_500);
        assert_eq!(sub_bps(10_000, 500).unwrap(), 9_500);
        assert_eq!(sub_bps(10_000, 20_000).unwrap(), 0);
    }

    proptest! {
        #[test]
        fn prop_render_then_parse_is_identity(value in 0u64..u64::MAX / 2, precision in 0u32..=8) {
            prop_assert_eq!(to_scaled(&from_scaled(value, precision), precision).unwrap(), value);
        }

        #[test]
        fn prop_quote_never_exceeds_product(price in 1u64..1_000_000_000, amount in 1u64..1_000_000_000) {
            let quote = quote_amount(price, amount, 4).unwrap();
            prop_assert!(base_for_quote(quote, price, 4).unwrap() <= amount);
        }
    }
}
