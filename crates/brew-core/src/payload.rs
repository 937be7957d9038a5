//! Probing helpers for loosely shaped backend JSON.
//!
//! Backend records carry the same fact under several spellings; the helpers
//! here return the first present, non-null candidate so callers can list the
//! variants in priority order.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("unexpected payload shape: {0}")]
    Shape(String),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn value_field<'a>(source: &'a Value, key: &str) -> Option<&'a Value> {
    source
        .as_object()?
        .get(key)
        .filter(|value| !value.is_null())
}

pub fn value_by_keys<'a>(source: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    for key in keys {
        if let Some(value) = value_field(source, key) {
            return Some(value);
        }
    }
    None
}

pub fn value_at_path<'a>(source: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = source;
    for key in path {
        current = value_field(current, key)?;
    }
    Some(current)
}

/// Non-empty strings pass through trimmed; numeric ids are stringified.
pub fn string_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

pub fn string_by_keys(source: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| value_field(source, key))
        .find_map(string_from_value)
}

pub fn f64_from_value(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

pub fn f64_by_keys(source: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .filter_map(|key| value_field(source, key))
        .find_map(f64_from_value)
}

/// RFC 3339 first, then naive ISO forms read as UTC.
pub fn parse_timestamp_str(input: &str) -> Option<DateTime<Utc>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// Strings as in [`parse_timestamp_str`]; integers are epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => parse_timestamp_str(text),
        Value::Number(number) => {
            let millis = number
                .as_i64()
                .or_else(|| number.as_f64().filter(|v| v.is_finite()).map(|v| v as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}

pub fn timestamp_by_keys(source: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter()
        .filter_map(|key| value_field(source, key))
        .find_map(parse_timestamp)
}

pub fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(string_from_value).collect(),
        Some(other) => string_from_value(other).into_iter().collect(),
        None => Vec::new(),
    }
}

pub fn parse_json(input: &str) -> Result<Value, PayloadError> {
    Ok(serde_json::from_str(input)?)
}
