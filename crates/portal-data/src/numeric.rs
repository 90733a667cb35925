//! Exact conversions between on-chain integer amounts and display numbers.
//!
//! Every function here absorbs malformed input into a zero value: the
//! numbers drive display only and a bad row must not break a page.

use num_bigint::BigUint;

/// Exponents beyond this are treated as malformed rather than expanded.
const MAX_EXPONENT: i64 = 512;

/// Parse an integer amount that may arrive as a decimal string, a `0x` hex
/// quantity, a decimal fraction (truncated) or scientific notation.
///
/// Malformed, negative, empty and NaN-like inputs yield zero.
pub fn parse_integer_amount(raw: &str) -> BigUint {
    match try_parse_integer_amount(raw) {
        Some(n) => n,
        None => {
            tracing::debug!(input = raw, "unparseable amount, using zero");
            BigUint::from(0u8)
        }
    }
}

fn try_parse_integer_amount(raw: &str) -> Option<BigUint> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(hex_digits) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        if hex_digits.is_empty() {
            return Some(BigUint::from(0u8));
        }
        return BigUint::parse_bytes(hex_digits.as_bytes(), 16);
    }

    let s = s.to_ascii_lowercase();
    let s = s.strip_prefix('+').unwrap_or(&s);

    let (mantissa, exponent) = match s.split_once('e') {
        Some((m, e)) => {
            let e = e.strip_prefix('+').unwrap_or(e);
            (m, e.parse::<i64>().ok()?)
        }
        None => (s, 0),
    };
    if exponent.abs() > MAX_EXPONENT {
        return None;
    }

    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }

    let mut digits = String::with_capacity(int_part.len() + frac_part.len());
    digits.push_str(int_part);
    digits.push_str(frac_part);

    let shift = exponent - frac_part.len() as i64;
    if shift >= 0 {
        digits.push_str(&"0".repeat(shift as usize));
    } else {
        let cut = (-shift) as usize;
        if cut >= digits.len() {
            return Some(BigUint::from(0u8));
        }
        digits.truncate(digits.len() - cut);
    }

    if digits.is_empty() {
        return Some(BigUint::from(0u8));
    }
    BigUint::parse_bytes(digits.as_bytes(), 10)
}

/// `10^decimals` as a big integer.
pub fn pow10(decimals: u8) -> BigUint {
    BigUint::from(10u8).pow(u32::from(decimals))
}

/// Format a raw integer amount with decimal places, trimming trailing zeros.
pub fn format_with_decimals(amount: &BigUint, decimals: u8) -> String {
    if decimals == 0 {
        return amount.to_string();
    }

    let scale = pow10(decimals);
    let whole = amount / &scale;
    let frac = amount % &scale;

    let frac_str = frac.to_string();
    let mut padded = "0".repeat(decimals as usize - frac_str.len());
    padded.push_str(&frac_str);
    let trimmed = padded.trim_end_matches('0');

    if trimmed.is_empty() {
        whole.to_string()
    } else {
        format!("{whole}.{trimmed}")
    }
}

/// Format a raw amount string with decimals. Bad input renders as `"0"`.
pub fn format_amount(raw: &str, decimals: u8) -> String {
    format_with_decimals(&parse_integer_amount(raw), decimals)
}

/// Convert a raw integer amount to a float, dividing exactly first.
pub fn to_decimal(amount: &BigUint, decimals: u8) -> f64 {
    format_with_decimals(amount, decimals)
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// Parse a decimal string (e.g. `"0.050000000000000000"`), zero on failure.
pub fn parse_decimal(raw: &str) -> f64 {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// `amount × unit_price`, zero when either side is not finite.
pub fn total_price(amount: f64, unit_price: f64) -> f64 {
    let total = amount * unit_price;
    if total.is_finite() {
        total
    } else {
        0.0
    }
}

/// `part / total` as a percentage with six fractional digits of precision.
/// A zero total yields zero.
pub fn percent(part: &BigUint, total: &BigUint) -> f64 {
    if total.bits() == 0 {
        return 0.0;
    }
    let scaled = part * BigUint::from(100_000_000u64) / total;
    to_decimal(&scaled, 6)
}

/// Render a USD value with two decimals and thousands separators.
pub fn format_usd(value: f64) -> String {
    let value = if value.is_finite() { value } else { 0.0 };
    let negative = value < 0.0;
    let cents = (value.abs() * 100.0).round() as u128;
    let whole = (cents / 100).to_string();
    let frac = cents % 100;

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, c) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    let sign = if negative && cents > 0 { "-" } else { "" };
    format!("{sign}${grouped}.{frac:02}")
}

/// Serde adapter for big integer amounts: written as decimal strings, read
/// from strings or numbers in any format [`parse_integer_amount`] accepts.
pub mod amount_serde {
    use num_bigint::BigUint;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(match raw {
            Value::String(s) => super::parse_integer_amount(&s),
            Value::Number(n) => super::parse_integer_amount(&n.to_string()),
            _ => BigUint::from(0u8),
        })
    }
}
