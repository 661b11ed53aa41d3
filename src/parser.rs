// src/parser.rs
use crate::error::ValueParseError;
use rust_decimal::Decimal;

/// Decimal places of the smallest currency unit.
pub const SCALE: u32 = 8;

const UNITS_PER_COIN: i64 = 100_000_000;

/// Convert a wire decimal string (e.g. `"1.50"`) into base units.
///
/// Only plain `[-]digits[.digits]` text is accepted; signs other than a
/// leading `-`, exponents and separators are malformed. Fails rather than
/// rounding: more than 8 significant decimal places is `TooPrecise`.
pub fn to_base_units(raw: &str) -> Result<i64, ValueParseError> {
    let text = raw.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));

    let well_formed = !(int_part.is_empty() && frac_part.is_empty())
        && int_part.bytes().all(|b| b.is_ascii_digit())
        && frac_part.bytes().all(|b| b.is_ascii_digit());
    if !well_formed {
        return Err(ValueParseError::Malformed(raw.to_string()));
    }

    // -0 and -0.00 are zero
    if negative && digits.bytes().any(|b| matches!(b, b'1'..=b'9')) {
        return Err(ValueParseError::Negative(raw.to_string()));
    }

    let frac = frac_part.trim_end_matches('0');
    if frac.len() > SCALE as usize {
        return Err(ValueParseError::TooPrecise(raw.to_string()));
    }

    let overflow = || ValueParseError::Overflow(raw.to_string());

    let int_digits = int_part.trim_start_matches('0');
    let whole: i64 = if int_digits.is_empty() {
        0
    } else {
        int_digits.parse().map_err(|_| overflow())?
    };
    let fraction: i64 = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<8}")
            .parse()
            .map_err(|_| ValueParseError::Malformed(raw.to_string()))?
    };

    whole
        .checked_mul(UNITS_PER_COIN)
        .and_then(|units| units.checked_add(fraction))
        .ok_or_else(overflow)
}

/// Base units back to a normalized decimal (`150000000` → `1.5`).
pub fn from_base_units(units: i64) -> Decimal {
    Decimal::new(units, SCALE).normalize()
}

/// A sum of base units, which may exceed `i64`, as a normalized decimal.
pub fn total_from_base_units(units: i128) -> Result<Decimal, ValueParseError> {
    Decimal::try_from_i128_with_scale(units, SCALE)
        .map(|d| d.normalize())
        .map_err(|_| ValueParseError::Overflow(units.to_string()))
}
