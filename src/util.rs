/// Utility helpers shared by adapters and the collection loop.
///
/// This module contains:
/// - Time helpers
/// - Lenient JSON field readers (exchanges mix strings and numbers)
/// - Comma-separated list parsing for configuration
///
/// IMPORTANT:
/// - No exchange-specific business logic should live here.
/// - Everything here is pure and deterministic (except `now_*`).

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

/// Returns the current Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current time truncated to millisecond precision.
pub fn now_utc() -> DateTime<Utc> {
    ms_to_datetime(now_ms()).unwrap_or_else(Utc::now)
}

/// Converts Unix milliseconds to a UTC datetime.
///
/// Returns `None` for values outside chrono's representable range.
pub fn ms_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Reads a decimal from a JSON value that may be a string or a number.
///
/// Examples:
/// - `"0.0001"`   -> 0.0001
/// - `0.0001`     -> 0.0001
/// - `"1.25e-5"`  -> 0.0000125
pub fn parse_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::String(s) => decimal_from_str(s),
        Value::Number(n) => decimal_from_str(&n.to_string()),
        _ => None,
    }
}

fn decimal_from_str(s: &str) -> Option<Decimal> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}

/// Reads an integer from a JSON value that may be a string or a number.
pub fn parse_i64(v: &Value) -> Option<i64> {
    match v {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// Splits a comma-separated list, trimming whitespace and dropping
/// empty items. Items are lower-cased so exchange ids compare exactly.
pub fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decimals_from_strings_numbers_and_scientific() {
        assert_eq!(parse_decimal(&json!("0.0001")), Decimal::from_str("0.0001").ok());
        assert_eq!(parse_decimal(&json!(-0.0003)), Decimal::from_str("-0.0003").ok());
        assert_eq!(parse_decimal(&json!("1.25e-5")), Decimal::from_str("0.0000125").ok());
        assert_eq!(parse_decimal(&json!("")), None);
        assert_eq!(parse_decimal(&json!(null)), None);
    }

    #[test]
    fn integers_from_strings_and_numbers() {
        assert_eq!(parse_i64(&json!("1700000000000")), Some(1_700_000_000_000));
        assert_eq!(parse_i64(&json!(480)), Some(480));
        assert_eq!(parse_i64(&json!("abc")), None);
    }

    #[test]
    fn list_parsing_ignores_blanks() {
        assert_eq!(split_list(Some(" Bybit, ,okx,")), vec!["bybit", "okx"]);
        assert!(split_list(None).is_empty());
        assert!(split_list(Some("")).is_empty());
    }
}
