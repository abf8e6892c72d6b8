//! Typed values stored in the table.
//!
//! Every entry holds exactly one [`Value`].  The set of types mirrors what
//! dashboard widgets can display: scalars, raw bytes, and homogeneous arrays.
//!
//! # Type stability
//!
//! Once a key holds a value of some [`ValueType`], later writes must use the
//! same type.  A dashboard widget bound to a number would otherwise receive a
//! string and break.  The store enforces this rule (see
//! [`crate::store::table::StorageError::TypeMismatch`]).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Discriminant of a [`Value`], also used as the wire type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ValueType {
    Boolean = 0x00,
    Double = 0x01,
    String = 0x02,
    Raw = 0x03,
    BooleanArray = 0x10,
    DoubleArray = 0x11,
    StringArray = 0x12,
}

impl TryFrom<u8> for ValueType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ValueType::Boolean),
            0x01 => Ok(ValueType::Double),
            0x02 => Ok(ValueType::String),
            0x03 => Ok(ValueType::Raw),
            0x10 => Ok(ValueType::BooleanArray),
            0x11 => Ok(ValueType::DoubleArray),
            0x12 => Ok(ValueType::StringArray),
            _ => Err(()),
        }
    }
}

impl ValueType {
    /// Lower-case name used in logs and in the browser JSON protocol.
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Boolean => "boolean",
            ValueType::Double => "double",
            ValueType::String => "string",
            ValueType::Raw => "raw",
            ValueType::BooleanArray => "boolean_array",
            ValueType::DoubleArray => "double_array",
            ValueType::StringArray => "string_array",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed table value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Boolean(bool),
    Double(f64),
    String(String),
    Raw(Vec<u8>),
    BooleanArray(Vec<bool>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
}

impl Value {
    /// Returns the [`ValueType`] discriminant of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Boolean(_) => ValueType::Boolean,
            Value::Double(_) => ValueType::Double,
            Value::String(_) => ValueType::String,
            Value::Raw(_) => ValueType::Raw,
            Value::BooleanArray(_) => ValueType::BooleanArray,
            Value::DoubleArray(_) => ValueType::DoubleArray,
            Value::StringArray(_) => ValueType::StringArray,
        }
    }

    /// Bitwise equality: doubles compare by their bit pattern, so a `NaN`
    /// equals the same `NaN` and `0.0` differs from `-0.0`.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::DoubleArray(a), Value::DoubleArray(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            _ => self == other,
        }
    }

    /// Approximate heap footprint in bytes, used for store capacity checks.
    pub fn approx_size(&self) -> usize {
        match self {
            Value::Boolean(_) => 1,
            Value::Double(_) => 8,
            Value::String(s) => s.len(),
            Value::Raw(b) => b.len(),
            Value::BooleanArray(v) => v.len(),
            Value::DoubleArray(v) => v.len() * 8,
            Value::StringArray(v) => v.iter().map(String::len).sum(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Raw(v)
    }
}

impl From<Vec<bool>> for Value {
    fn from(v: Vec<bool>) -> Self {
        Value::BooleanArray(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::DoubleArray(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::StringArray(v)
    }
}
