use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::FieldParser;

/// Parsers for the column types the change-stream sends as strings.
pub fn default_parsers() -> HashMap<String, FieldParser> {
  let mut parsers: HashMap<String, FieldParser> = HashMap::new();
  parsers.insert("timestamptz".into(), Arc::new(parse_timestamptz));
  parsers.insert("timestamp".into(), Arc::new(parse_timestamp));
  parsers.insert("int8".into(), Arc::new(parse_int));
  parsers.insert("int4".into(), Arc::new(parse_int));
  parsers.insert("bool".into(), Arc::new(parse_bool));
  parsers
}

/// Normalise to RFC 3339 in UTC. Unparseable input is passed through.
fn parse_timestamptz(raw: &str) -> Value {
  DateTime::parse_from_rfc3339(raw)
    // Postgres renders "2024-01-02 03:04:05.123+00"
    .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z"))
    .map(|dt| Value::String(dt.with_timezone(&Utc).to_rfc3339()))
    .unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_timestamp(raw: &str) -> Value {
  NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
    .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
    .map(|dt| Value::String(dt.and_utc().to_rfc3339()))
    .unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_int(raw: &str) -> Value {
  raw
    .parse::<i64>()
    .map(Value::from)
    .unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_bool(raw: &str) -> Value {
  match raw {
    "t" | "true" => Value::Bool(true),
    "f" | "false" => Value::Bool(false),
    other => Value::String(other.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_timestamptz() {
    assert_eq!(
      parse_timestamptz("2024-01-02 03:04:05+00"),
      Value::String("2024-01-02T03:04:05+00:00".into())
    );
    assert_eq!(
      parse_timestamptz("2024-01-02T05:04:05+02:00"),
      Value::String("2024-01-02T03:04:05+00:00".into())
    );
    assert_eq!(parse_timestamptz("yesterday"), Value::String("yesterday".into()));
  }

  #[test]
  fn test_timestamp() {
    assert_eq!(
      parse_timestamp("2024-01-02 03:04:05"),
      Value::String("2024-01-02T03:04:05+00:00".into())
    );
  }

  #[test]
  fn test_int_and_bool() {
    assert_eq!(parse_int("42"), Value::from(42));
    assert_eq!(parse_int("4.2"), Value::String("4.2".into()));
    assert_eq!(parse_bool("t"), Value::Bool(true));
    assert_eq!(parse_bool("false"), Value::Bool(false));
  }
}
