//! ---
//! ems_section: "02-tag-layer"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Logical tag values and transport-native wire scalars."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use plclink_common::TagKind;
use serde::Serialize;
use serde_json::Value;

use crate::error::{LinkError, Result};

/// Value of a logical tag. The variant always matches the tag's declared kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl TagValue {
    pub fn kind(&self) -> TagKind {
        match self {
            TagValue::Bool(_) => TagKind::Bool,
            TagValue::Integer(_) => TagKind::Integer,
            TagValue::Real(_) => TagKind::Real,
            TagValue::Text(_) => TagKind::String,
        }
    }

    /// Convert a JSON request value against the declared kind of `tag`.
    ///
    /// No coercion happens: `"1"` is not an integer and `1` is not a boolean.
    pub fn from_json(tag: &str, kind: TagKind, value: &Value) -> Result<Self> {
        let converted = match (kind, value) {
            (TagKind::Bool, Value::Bool(b)) => Some(TagValue::Bool(*b)),
            (TagKind::Integer, Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    Some(TagValue::Integer(i))
                } else if n.is_u64() {
                    return Err(LinkError::out_of_range(tag, format!("{n} exceeds i64")));
                } else {
                    None
                }
            }
            (TagKind::Real, Value::Number(n)) => n.as_f64().map(TagValue::Real),
            (TagKind::String, Value::String(s)) => Some(TagValue::Text(s.clone())),
            _ => None,
        };
        converted.ok_or_else(|| {
            LinkError::type_mismatch(tag, format!("expected {kind}, got {}", json_kind(value)))
        })
    }

    pub fn to_json(&self) -> Value {
        match self {
            TagValue::Bool(b) => Value::Bool(*b),
            TagValue::Integer(i) => Value::from(*i),
            TagValue::Real(f) => Value::from(*f),
            TagValue::Text(s) => Value::String(s.clone()),
        }
    }

    /// Numeric view used by quantity comparisons.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::Integer(i) => Some(*i as f64),
            TagValue::Real(f) => Some(*f),
            _ => None,
        }
    }

    /// Flag view: booleans directly, integers by non-zero.
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            TagValue::Bool(b) => Some(*b),
            TagValue::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Bool(b) => write!(f, "{b}"),
            TagValue::Integer(i) => write!(f, "{i}"),
            TagValue::Real(r) => write!(f, "{r}"),
            TagValue::Text(s) => write!(f, "{s:?}"),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "real number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Transport-native scalar types.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WireType {
    Bool,
    Sint,
    Dint,
    Real,
}

impl WireType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireType::Bool => "BOOL",
            WireType::Sint => "SINT",
            WireType::Dint => "DINT",
            WireType::Real => "REAL",
        }
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Widen a REAL through its shortest decimal form, so `0.1f32` comes back
/// as `0.1` rather than `0.10000000149011612`.
pub fn widen_real(v: f32) -> f64 {
    v.to_string().parse().unwrap_or(f64::from(v))
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum WireValue {
    Bool(bool),
    Sint(i8),
    Dint(i32),
    Real(f32),
}

impl WireValue {
    pub fn wire_type(&self) -> WireType {
        match self {
            WireValue::Bool(_) => WireType::Bool,
            WireValue::Sint(_) => WireType::Sint,
            WireValue::Dint(_) => WireType::Dint,
            WireValue::Real(_) => WireType::Real,
        }
    }

    /// Zero value of the given type, as an unwritten controller tag reads.
    pub fn zero(wire_type: WireType) -> Self {
        match wire_type {
            WireType::Bool => WireValue::Bool(false),
            WireType::Sint => WireValue::Sint(0),
            WireType::Dint => WireValue::Dint(0),
            WireType::Real => WireValue::Real(0.0),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            WireValue::Bool(b) => Value::Bool(*b),
            WireValue::Sint(v) => Value::from(*v),
            WireValue::Dint(v) => Value::from(*v),
            WireValue::Real(v) => Value::from(widen_real(*v)),
        }
    }
}

impl fmt::Display for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireValue::Bool(b) => write!(f, "{b}"),
            WireValue::Sint(v) => write!(f, "{v}"),
            WireValue::Dint(v) => write!(f, "{v}"),
            WireValue::Real(v) => write!(f, "{v}"),
        }
    }
}

/// One element-level read against the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRead {
    pub address: String,
    pub wire_type: WireType,
}

/// One element-level write against the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct WireWrite {
    pub address: String,
    pub value: WireValue,
}
