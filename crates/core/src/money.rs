//! Fixed-point monetary helpers.
//!
//! All monetary fields in the system are `rust_decimal::Decimal` values with
//! exactly 6 fractional digits. Using a fixed-point type instead of `f64`
//! keeps the policy document hash and request fingerprints stable
//! across platforms — float formatting is not guaranteed bit-for-bit
//! identical across architectures, decimal string formatting is.

use rust_decimal::Decimal;

pub const MONEY_SCALE: u32 = 6;

/// Normalizes a decimal to exactly [`MONEY_SCALE`] fractional digits so that
/// canonical serialization is stable regardless of how the value was parsed.
pub fn normalize(value: Decimal) -> Decimal {
    value.round_dp(MONEY_SCALE)
}

/// Renders a decimal using a fixed number of fractional digits, suitable for
/// inclusion in canonical payloads and CSV export columns.
pub fn to_canonical_string(value: Decimal) -> String {
    format!("{:.*}", MONEY_SCALE as usize, normalize(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_trailing_digits() {
        let v = Decimal::new(121, 1); // 12.1
        assert_eq!(to_canonical_string(v), "12.100000");
    }

    #[test]
    fn rounds_excess_precision() {
        let v = Decimal::new(123456789, 7); // 12.3456789
        assert_eq!(to_canonical_string(v), "12.345679");
    }
}
