//! Host-side representation of values crossing the engine boundary.
//!
//! Values are copied across the boundary at call time; a `JSValue` never
//! refers back into an isolate. The enum represents special numeric values
//! (NaN, ±Infinity) verbatim and conversion enforces depth/size limits.

use crate::runtime::error::BridgeError;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Maximum depth for JavaScript value conversion
pub const MAX_JS_DEPTH: usize = 100;
/// Maximum size in bytes for JavaScript value conversion
pub const MAX_JS_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// Largest integer a JavaScript number represents exactly (2^53 - 1).
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// Error object thrown by script or raised by a host function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JsErrorValue {
    /// Constructor name, e.g. `TypeError`
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl JsErrorValue {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }
}

/// Marshalled JavaScript value.
///
/// Note: The Serialize/Deserialize implementations are manual because the
/// Unsupported variant cannot be serialized.
#[derive(Clone, Debug, PartialEq)]
pub enum JSValue {
    /// JavaScript null or undefined
    Null,
    Bool(bool),
    /// Integral number within ±(2^53 - 1)
    Int(i64),
    /// Any other number, including NaN and ±Infinity
    Float(f64),
    String(String),
    /// JavaScript array (preserves order)
    Array(Vec<JSValue>),
    /// Plain object (insertion order preserved)
    Object(IndexMap<String, JSValue>),
    Date(DateTime<Utc>),
    Error(JsErrorValue),
    /// Marker for engine values with no host form; holds the `typeof` name.
    /// Passing it back into the engine fails with `UnsupportedValue`.
    Unsupported(String),
}

impl JSValue {
    /// Number view of `Int` and `Float` values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            JSValue::Int(i) => Some(*i as f64),
            JSValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JSValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, JSValue::Null)
    }

    /// Short kind name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            JSValue::Null => "null",
            JSValue::Bool(_) => "boolean",
            JSValue::Int(_) => "integer",
            JSValue::Float(_) => "double",
            JSValue::String(_) => "string",
            JSValue::Array(_) => "array",
            JSValue::Object(_) => "object",
            JSValue::Date(_) => "date",
            JSValue::Error(_) => "error",
            JSValue::Unsupported(_) => "unsupported",
        }
    }
}

impl From<bool> for JSValue {
    fn from(value: bool) -> Self {
        JSValue::Bool(value)
    }
}

impl From<i64> for JSValue {
    fn from(value: i64) -> Self {
        JSValue::Int(value)
    }
}

impl From<i32> for JSValue {
    fn from(value: i32) -> Self {
        JSValue::Int(i64::from(value))
    }
}

impl From<f64> for JSValue {
    fn from(value: f64) -> Self {
        JSValue::Float(value)
    }
}

impl From<&str> for JSValue {
    fn from(value: &str) -> Self {
        JSValue::String(value.to_owned())
    }
}

impl From<String> for JSValue {
    fn from(value: String) -> Self {
        JSValue::String(value)
    }
}

impl From<Vec<JSValue>> for JSValue {
    fn from(value: Vec<JSValue>) -> Self {
        JSValue::Array(value)
    }
}

impl From<IndexMap<String, JSValue>> for JSValue {
    fn from(value: IndexMap<String, JSValue>) -> Self {
        JSValue::Object(value)
    }
}

impl From<DateTime<Utc>> for JSValue {
    fn from(value: DateTime<Utc>) -> Self {
        JSValue::Date(value)
    }
}

// Manual Serialize implementation that errors on the Unsupported variant
impl Serialize for JSValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::{Error, SerializeMap};
        match self {
            JSValue::Null => serializer.serialize_none(),
            JSValue::Bool(b) => serializer.serialize_bool(*b),
            JSValue::Int(i) => serializer.serialize_i64(*i),
            JSValue::Float(f) => serializer.serialize_f64(*f),
            JSValue::String(s) => serializer.serialize_str(s),
            JSValue::Array(arr) => arr.serialize(serializer),
            JSValue::Object(obj) => obj.serialize(serializer),
            JSValue::Date(date) => serializer.serialize_str(&date.to_rfc3339()),
            JSValue::Error(err) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("name", &err.name)?;
                map.serialize_entry("message", &err.message)?;
                map.end()
            }
            JSValue::Unsupported(kind) => Err(Error::custom(format!(
                "Cannot serialize JSValue::Unsupported ({kind}); engine {kind} values do not cross the boundary"
            ))),
        }
    }
}

// Manual Deserialize implementation producing only data variants
impl<'de> Deserialize<'de> for JSValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct JSValueVisitor;

        impl<'de> Visitor<'de> for JSValueVisitor {
            type Value = JSValue;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter
                    .write_str("a JavaScript value (null, bool, number, string, array, or object)")
            }

            fn visit_bool<E>(self, value: bool) -> Result<Self::Value, E> {
                Ok(JSValue::Bool(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E> {
                if value.unsigned_abs() <= MAX_SAFE_INTEGER as u64 {
                    Ok(JSValue::Int(value))
                } else {
                    Ok(JSValue::Float(value as f64))
                }
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E> {
                if value <= MAX_SAFE_INTEGER as u64 {
                    Ok(JSValue::Int(value as i64))
                } else {
                    Ok(JSValue::Float(value as f64))
                }
            }

            fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E> {
                Ok(JSValue::Float(value))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E> {
                Ok(JSValue::String(value.to_owned()))
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E> {
                Ok(JSValue::String(value))
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(JSValue::Null)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(JSValue::Null)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut vec = Vec::new();
                while let Some(elem) = seq.next_element()? {
                    vec.push(elem);
                }
                Ok(JSValue::Array(vec))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut obj = IndexMap::new();
                while let Some((key, value)) = map.next_entry()? {
                    obj.insert(key, value);
                }
                Ok(JSValue::Object(obj))
            }
        }

        deserializer.deserialize_any(JSValueVisitor)
    }
}

/// Tracks depth and size limits during value conversion.
///
/// Used while traversing engine or Python values to bound memory usage and
/// recursion depth.
pub struct LimitTracker {
    max_depth: usize,
    max_bytes: usize,
    current_depth: usize,
    current_bytes: usize,
}

impl LimitTracker {
    pub fn new(max_depth: usize, max_bytes: usize) -> Self {
        Self {
            max_depth,
            max_bytes,
            current_depth: 0,
            current_bytes: 0,
        }
    }

    /// Enter a new depth level.
    pub fn enter(&mut self) -> Result<(), BridgeError> {
        self.current_depth += 1;
        if self.current_depth > self.max_depth {
            return Err(BridgeError::Conversion(format!(
                "Depth exceeded maximum limit of {}",
                self.max_depth
            )));
        }
        Ok(())
    }

    pub fn exit(&mut self) {
        self.current_depth = self.current_depth.saturating_sub(1);
    }

    pub fn add_bytes(&mut self, bytes: usize) -> Result<(), BridgeError> {
        self.current_bytes += bytes;
        if self.current_bytes > self.max_bytes {
            return Err(BridgeError::Conversion(format!(
                "Size ({} bytes) exceeded maximum limit of {} bytes",
                self.current_bytes, self.max_bytes
            )));
        }
        Ok(())
    }
}

impl Default for LimitTracker {
    fn default() -> Self {
        Self::new(MAX_JS_DEPTH, MAX_JS_BYTES)
    }
}
