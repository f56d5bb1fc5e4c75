//! Human-friendly data-size expressions.
//!
//! Accepts sizes like `64MiB`, `10GB`, `1024` and products like
//! `4*1024*1024`. Decimal and IEC unit spellings are both treated as
//! powers of 1024, matching the capacity semantics of the disk cache.

use crate::error::{Error, Result};

const KIB: u64 = 1024;

/// Evaluate a size expression to a byte count.
///
/// Each `*`-separated factor may carry a unit suffix; factors are multiplied
/// together. Whitespace around factors is ignored.
pub fn evaluate(expr: &str) -> Result<u64> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidSize("size expression is blank".to_string()));
    }

    let mut total: u64 = 1;
    for factor in trimmed.split('*') {
        let value = evaluate_factor(factor.trim())
            .ok_or_else(|| Error::InvalidSize(format!("cannot parse '{factor}' in '{expr}'")))?;
        total = total
            .checked_mul(value)
            .ok_or_else(|| Error::InvalidSize(format!("size overflow in '{expr}'")))?;
    }
    Ok(total)
}

/// Evaluate a size expression, requiring a positive result that fits a usize.
pub fn parse_bytes(expr: &str) -> Result<usize> {
    let value = evaluate(expr)?;
    if value == 0 {
        return Err(Error::InvalidSize(format!("size must be > 0: '{expr}'")));
    }
    usize::try_from(value).map_err(|_| Error::InvalidSize(format!("size out of range: '{expr}'")))
}

fn evaluate_factor(factor: &str) -> Option<u64> {
    let (digits, unit) = split_unit(factor);
    let number: u64 = digits.parse().ok()?;
    let multiplier = match unit.to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => KIB,
        "M" | "MB" | "MIB" => KIB * KIB,
        "G" | "GB" | "GIB" => KIB * KIB * KIB,
        "T" | "TB" | "TIB" => KIB * KIB * KIB * KIB,
        _ => return None,
    };
    number.checked_mul(multiplier)
}

fn split_unit(factor: &str) -> (&str, &str) {
    let end = factor
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(factor.len());
    (&factor[..end], factor[end..].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_numbers() {
        assert_eq!(evaluate("1024").unwrap(), 1024);
        assert_eq!(evaluate(" 42 ").unwrap(), 42);
    }

    #[test]
    fn test_units() {
        assert_eq!(evaluate("4MB").unwrap(), 4 * 1024 * 1024);
        assert_eq!(evaluate("4MiB").unwrap(), 4 * 1024 * 1024);
        assert_eq!(evaluate("2gb").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(evaluate("1TiB").unwrap(), 1024u64.pow(4));
        assert_eq!(evaluate("8 KB").unwrap(), 8 * 1024);
    }

    #[test]
    fn test_products() {
        assert_eq!(evaluate("4*1024*1024").unwrap(), 4 * 1024 * 1024);
        assert_eq!(evaluate("2 * 16KB").unwrap(), 2 * 16 * 1024);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(evaluate("").is_err());
        assert!(evaluate("12XB").is_err());
        assert!(evaluate("MB").is_err());
        assert!(evaluate("4**2").is_err());
    }

    #[test]
    fn test_parse_bytes_rejects_zero() {
        assert!(parse_bytes("0").is_err());
        assert_eq!(parse_bytes("64KiB").unwrap(), 64 * 1024);
    }
}
