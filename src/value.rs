//! Scalar values used in conditions and result rows

use serde::{Deserialize, Serialize};
use std::fmt;

/// A scalar literal or result value
///
/// Appears on the right-hand side of conditions, inside function arguments,
/// and as cell values in result rows. `Null` doubles as the explicit missing
/// marker for aggregates a secondary entity did not produce (see the merge
/// rules in [`crate::router`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// String value
    Str(String),
    /// Signed integer value
    Int(i64),
    /// Unsigned integer value (indexer ids, counts)
    UInt(u64),
    /// Floating point value
    Float(f64),
    /// Explicit null / missing marker
    Null,
}

impl Value {
    /// True when this is the explicit missing marker
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrow as a string if this is a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view for ordering comparisons; strings and null have none
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{}", s),
            Value::Int(v) => write!(f, "{}", v),
            Value::UInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Null => write!(f, "null"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

/// Declared output type of a projected column, reported in result meta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    /// UTF-8 string
    String,
    /// Unsigned 64-bit integer
    UInt64,
    /// Signed 64-bit integer
    Int64,
    /// 64-bit float
    Float64,
    /// Timestamp with timezone
    DateTime,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::String => "String",
            ValueType::UInt64 => "UInt64",
            ValueType::Int64 => "Int64",
            ValueType::Float64 => "Float64",
            ValueType::DateTime => "DateTime",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_marker() {
        assert!(Value::Null.is_null());
        assert!(!Value::UInt(0).is_null());
    }

    #[test]
    fn test_numeric_view() {
        assert_eq!(Value::Int(-3).as_f64(), Some(-3.0));
        assert_eq!(Value::Str("x".into()).as_f64(), None);
    }

    #[test]
    fn test_type_names() {
        assert_eq!(ValueType::UInt64.to_string(), "UInt64");
        assert_eq!(ValueType::Float64.to_string(), "Float64");
    }
}
