//! Conversion between stored text and typed application values.
//!
//! Stores keep most values as text (dataset tables are created from files of
//! unknown shape). Every value read through the handler passes through
//! [`coerce`] to reach the type the caller asked for.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{StoreError, StoreResult};

/// Target type of a coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Integer,
    Float,
    Boolean,
    List,
    Mapping,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::String => "str",
            ValueKind::Integer => "int",
            ValueKind::Float => "float",
            ValueKind::Boolean => "bool",
            ValueKind::List => "list",
            ValueKind::Mapping => "dict",
        }
    }

    /// SQLite column type used when a declared schema carries this kind.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ValueKind::Integer | ValueKind::Boolean => "INTEGER",
            ValueKind::Float => "REAL",
            ValueKind::String | ValueKind::List | ValueKind::Mapping => "TEXT",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueKind {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "str" | "string" | "text" => Ok(ValueKind::String),
            "int" | "integer" => Ok(ValueKind::Integer),
            "float" | "real" => Ok(ValueKind::Float),
            "bool" | "boolean" => Ok(ValueKind::Boolean),
            "list" => Ok(ValueKind::List),
            "dict" | "mapping" | "map" => Ok(ValueKind::Mapping),
            other => Err(StoreError::UnsupportedType(other.to_owned())),
        }
    }
}

/// A typed application value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<JsonValue>),
    Mapping(Map<String, JsonValue>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Consumes a text value. Any other variant is rendered with [`serialize`].
    pub fn into_text(self) -> String {
        match self {
            Value::Text(text) => text,
            other => serialize(&other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&serialize(self))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&String> for Value {
    fn from(value: &String) -> Self {
        Value::Text(value.clone())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Converts stored text into `kind`.
pub fn coerce(value: &str, kind: ValueKind) -> StoreResult<Value> {
    match kind {
        ValueKind::String => Ok(Value::Text(value.to_owned())),
        ValueKind::Integer => value
            .trim()
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| StoreError::conversion(value, kind)),
        ValueKind::Float => value
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| StoreError::conversion(value, kind)),
        ValueKind::Boolean => parse_bool_literal(value)
            .map(Value::Boolean)
            .ok_or_else(|| StoreError::conversion(value, kind)),
        ValueKind::List => match serde_json::from_str::<JsonValue>(value) {
            Ok(JsonValue::Array(items)) => Ok(Value::List(items)),
            _ => Err(StoreError::conversion(value, kind)),
        },
        ValueKind::Mapping => match serde_json::from_str::<JsonValue>(value) {
            Ok(JsonValue::Object(map)) => Ok(Value::Mapping(map)),
            _ => Err(StoreError::conversion(value, kind)),
        },
    }
}

/// Coerces a value read from the store. Native integers and reals skip the
/// text round-trip; NULL stays null whatever the requested kind.
pub fn coerce_value(value: Value, kind: ValueKind) -> StoreResult<Value> {
    match (value, kind) {
        (Value::Null, _) => Ok(Value::Null),
        (Value::Integer(n), ValueKind::Integer) => Ok(Value::Integer(n)),
        (Value::Integer(n), ValueKind::Float) => Ok(Value::Float(n as f64)),
        (Value::Integer(n), ValueKind::Boolean) => Ok(Value::Boolean(n != 0)),
        (Value::Float(x), ValueKind::Float) => Ok(Value::Float(x)),
        (Value::Text(text), kind) => coerce(&text, kind),
        (other, kind) => coerce(&serialize(&other), kind),
    }
}

/// Parses a kind name such as `"int"` and coerces `value` into it.
pub fn coerce_named(value: &str, kind: &str) -> StoreResult<Value> {
    coerce(value, kind.parse()?)
}

/// Renders a value as the text [`coerce`] reads back.
pub fn serialize(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Boolean(true) => "True".to_owned(),
        Value::Boolean(false) => "False".to_owned(),
        Value::Integer(value) => value.to_string(),
        Value::Float(value) => format_float(*value),
        Value::Text(text) => text.clone(),
        Value::List(items) => JsonValue::Array(items.clone()).to_string(),
        Value::Mapping(map) => JsonValue::Object(map.clone()).to_string(),
    }
}

// `1.0_f64.to_string()` is "1", which reads back as an integer-looking float.
fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

/// Literal evaluation limited to `True`, `False` and numeric literals.
fn parse_bool_literal(value: &str) -> Option<bool> {
    let trimmed = value.trim();
    match trimmed {
        "True" => return Some(true),
        "False" => return Some(false),
        _ => {}
    }
    if let Ok(number) = trimmed.parse::<i64>() {
        return Some(number != 0);
    }
    match trimmed.parse::<f64>() {
        Ok(number) if number.is_finite() && looks_numeric(trimmed) => Some(number != 0.0),
        _ => None,
    }
}

// `f64::from_str` also accepts "inf" and "NaN", which are not literals.
fn looks_numeric(text: &str) -> bool {
    text.chars()
        .all(|ch| ch.is_ascii_digit() || matches!(ch, '.' | '-' | '+' | 'e' | 'E' | '_'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_every_kind() {
        let samples = vec![
            (Value::Text("hello world".into()), ValueKind::String),
            (Value::Text(String::new()), ValueKind::String),
            (Value::Integer(-42), ValueKind::Integer),
            (Value::Float(2.5), ValueKind::Float),
            (Value::Float(3.0), ValueKind::Float),
            (Value::Boolean(true), ValueKind::Boolean),
            (Value::Boolean(false), ValueKind::Boolean),
            (Value::List(vec![json!("a"), json!(1)]), ValueKind::List),
            (Value::List(Vec::new()), ValueKind::List),
            (
                Value::Mapping(json!({"a": 1, "b": [true]}).as_object().cloned().unwrap()),
                ValueKind::Mapping,
            ),
            (Value::Mapping(Map::new()), ValueKind::Mapping),
        ];

        for (value, kind) in samples {
            let text = serialize(&value);
            assert_eq!(coerce(&text, kind).unwrap(), value, "kind {kind}");
        }
    }

    #[test]
    fn numeric_parse_failures_are_conversion_errors() {
        assert!(matches!(
            coerce("twelve", ValueKind::Integer),
            Err(StoreError::Conversion { .. })
        ));
        assert!(matches!(
            coerce("1.5x", ValueKind::Float),
            Err(StoreError::Conversion { .. })
        ));
    }

    #[test]
    fn boolean_accepts_only_literals() {
        assert_eq!(coerce("True", ValueKind::Boolean).unwrap(), Value::Boolean(true));
        assert_eq!(coerce("0", ValueKind::Boolean).unwrap(), Value::Boolean(false));
        assert_eq!(coerce("2.5", ValueKind::Boolean).unwrap(), Value::Boolean(true));
        for bad in ["true", "yes", "", "__import__('os')", "inf", "NaN"] {
            assert!(
                matches!(coerce(bad, ValueKind::Boolean), Err(StoreError::Conversion { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn structured_kinds_reject_wrong_shapes() {
        assert!(coerce("{\"a\": 1}", ValueKind::List).is_err());
        assert!(coerce("[1, 2]", ValueKind::Mapping).is_err());
        assert!(coerce("[1, 2", ValueKind::List).is_err());
    }

    #[test]
    fn stored_numbers_coerce_without_text() {
        assert_eq!(
            coerce_value(Value::Integer(3), ValueKind::Float).unwrap(),
            Value::Float(3.0)
        );
        assert_eq!(
            coerce_value(Value::Integer(0), ValueKind::Boolean).unwrap(),
            Value::Boolean(false)
        );
        assert_eq!(
            coerce_value(Value::Integer(12), ValueKind::String).unwrap(),
            Value::Text("12".into())
        );
        assert_eq!(coerce_value(Value::Null, ValueKind::List).unwrap(), Value::Null);
    }

    #[test]
    fn unknown_kind_names_are_unsupported() {
        assert!(matches!(
            coerce_named("1", "decimal"),
            Err(StoreError::UnsupportedType(name)) if name == "decimal"
        ));
        assert_eq!(coerce_named("7", " INT ").unwrap(), Value::Integer(7));
    }
}
