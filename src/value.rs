//! Dynamic values moved between entities, JSON payloads and SQLite
//!
//! Every bound parameter passes through [`Value::bind`], which applies the
//! coercion rule of the target column. Every selected column passes through
//! [`Value::from_column`].

use chrono::{DateTime, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::Value as JsonValue;
use crate::date::DateFormatter;
use crate::entity::ColumnType;
use crate::{Error, Result};

/// A property value read off an entity or a JSON map
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Date(DateTime<Utc>),
    /// Identifier list feeding a many-to-many link
    Ids(Vec<i64>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive
            Value::Real(f) if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 => {
                Some(*f as i64)
            }
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Real(f) => Some(*f),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Value::Text(s) => Some(s),
            Value::Integer(n) => Some(n.to_string()),
            Value::Real(f) => Some(f.to_string()),
            _ => None,
        }
    }

    pub fn into_ids(self) -> Option<Vec<i64>> {
        match self {
            Value::Ids(ids) => Some(ids),
            Value::Integer(n) => Some(vec![n]),
            Value::Null => Some(Vec::new()),
            _ => None,
        }
    }

    /// Convert a JSON payload value; `key` is only used in error messages
    pub fn from_json(key: &str, json: &JsonValue) -> Result<Self> {
        match json {
            JsonValue::Null => Ok(Value::Null),
            JsonValue::Bool(b) => Ok(Value::Integer(i64::from(*b))),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Real(f))
                } else {
                    Err(Error::binding(format!("Number out of range for {:?}: {}", key, n)))
                }
            }
            JsonValue::String(s) => Ok(Value::Text(s.clone())),
            JsonValue::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_i64().ok_or_else(|| {
                        Error::binding(format!("Expected integer ids in {:?}, found {}", key, item))
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(Value::Ids),
            JsonValue::Object(_) => Err(Error::binding(format!("Nested object not supported for {:?}", key))),
        }
    }

    /// Render as JSON; dates use the formatter's canonical text
    pub fn to_json(&self, formatter: &DateFormatter) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Integer(n) => JsonValue::from(*n),
            Value::Real(f) => serde_json::Number::from_f64(*f).map_or(JsonValue::Null, JsonValue::Number),
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::Date(d) => JsonValue::String(formatter.format(d)),
            Value::Ids(ids) => JsonValue::from(ids.clone()),
        }
    }

    /// Coerce into the SQLite value bound for a column of `column_type`
    pub fn bind(self, column: &str, column_type: ColumnType, formatter: &DateFormatter) -> Result<SqlValue> {
        if self.is_null() {
            return Ok(SqlValue::Null);
        }
        let mismatch = |value: &Value| {
            Error::binding(format!("Cannot bind {:?} to {} column {:?}", value, column_type, column))
        };

        match column_type {
            ColumnType::Integer => self.as_integer().map(SqlValue::Integer).ok_or_else(|| mismatch(&self)),
            ColumnType::Real => self.as_real().map(SqlValue::Real).ok_or_else(|| mismatch(&self)),
            ColumnType::Text => match self {
                Value::Date(d) => Ok(SqlValue::Text(formatter.format(&d))),
                other => {
                    let err = mismatch(&other);
                    other.into_text().map(SqlValue::Text).ok_or(err)
                }
            },
            ColumnType::Date => match self {
                Value::Date(d) => Ok(SqlValue::Text(formatter.format(&d))),
                Value::Text(s) => formatter.normalize(&s).map(SqlValue::Text),
                Value::Integer(secs) => DateTime::from_timestamp(secs, 0)
                    .map(|d| SqlValue::Text(formatter.format(&d)))
                    .ok_or_else(|| mismatch(&Value::Integer(secs))),
                other => Err(mismatch(&other)),
            },
            ColumnType::ManyToManyLink => Err(Error::binding(format!(
                "Link property {:?} has no column to bind",
                column
            ))),
        }
    }

    /// Read a selected column according to its declared type
    pub fn from_column(raw: ValueRef<'_>, column_type: ColumnType, formatter: &DateFormatter) -> Result<Self> {
        let value = match raw {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(n) => Value::Integer(n),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(bytes) => Value::Text(
                std::str::from_utf8(bytes)
                    .map_err(|e| Error::binding(format!("Column is not valid UTF-8: {}", e)))?
                    .to_string(),
            ),
            ValueRef::Blob(_) => return Err(Error::binding("Blob columns are not mapped")),
        };

        Ok(match (column_type, value) {
            (ColumnType::Date, Value::Text(s)) => Value::Date(formatter.parse(&s)?),
            (ColumnType::Date, Value::Integer(secs)) => {
                DateTime::from_timestamp(secs, 0).map_or(Value::Null, Value::Date)
            }
            (ColumnType::Real, Value::Integer(n)) => Value::Real(n as f64),
            (_, value) => value,
        })
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Real(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Integer(i64::from(b))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::Text(s.clone())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::Date(d)
    }
}

impl From<Vec<i64>> for Value {
    fn from(ids: Vec<i64>) -> Self {
        Value::Ids(ids)
    }
}

impl From<&[i64]> for Value {
    fn from(ids: &[i64]) -> Self {
        Value::Ids(ids.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}
