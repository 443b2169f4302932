//! Conversion between engine values and [`JSValue`].
//!
//! Both directions copy: nothing returned here refers back into the heap.
//! Cycles are detected against the chain of objects currently being
//! visited, so an object reachable twice through different parents still
//! converts, while an object reachable from itself fails with
//! [`BridgeError::CyclicValue`].

use crate::runtime::error::BridgeError;
use crate::runtime::js_value::{JSValue, JsErrorValue, LimitTracker, MAX_SAFE_INTEGER};
use chrono::{DateTime, Utc};
use deno_core::v8;
use indexmap::IndexMap;

/// Convert an engine value into its host form.
pub(crate) fn to_host<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> Result<JSValue, BridgeError> {
    let mut ancestors = Vec::new();
    let mut tracker = LimitTracker::default();
    to_host_internal(scope, value, &mut ancestors, &mut tracker)
}

/// Convert a host value into a fresh engine value.
pub(crate) fn to_engine<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &JSValue,
) -> Result<v8::Local<'s, v8::Value>, BridgeError> {
    let mut tracker = LimitTracker::default();
    to_engine_internal(scope, value, &mut tracker)
}

/// Classify an engine number as exact integer or double.
fn number_to_host(number: f64) -> JSValue {
    if number.is_finite() && number.fract() == 0.0 && number.abs() <= MAX_SAFE_INTEGER as f64 {
        JSValue::Int(number as i64)
    } else {
        JSValue::Float(number)
    }
}

fn to_host_internal<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
    ancestors: &mut Vec<v8::Local<'s, v8::Object>>,
    tracker: &mut LimitTracker,
) -> Result<JSValue, BridgeError> {
    tracker.enter()?;

    let result = if value.is_null_or_undefined() {
        tracker.add_bytes(4)?;
        Ok(JSValue::Null)
    } else if value.is_boolean() {
        tracker.add_bytes(1)?;
        Ok(JSValue::Bool(value.is_true()))
    } else if value.is_number() {
        tracker.add_bytes(8)?;
        let number = value
            .number_value(scope)
            .ok_or_else(|| BridgeError::Conversion("Failed to read number".to_string()))?;
        Ok(number_to_host(number))
    } else if value.is_big_int() {
        tracker.add_bytes(8)?;
        let bigint = v8::Local::<v8::BigInt>::try_from(value)
            .map_err(|_| BridgeError::Conversion("Failed to cast to BigInt".to_string()))?;
        let (as_i64, lossless) = bigint.i64_value();
        if lossless {
            Ok(JSValue::Int(as_i64))
        } else {
            // Outside i64: fall back to an approximate double via the decimal form.
            let text = value
                .to_string(scope)
                .map(|s| s.to_rust_string_lossy(scope))
                .unwrap_or_default();
            Ok(JSValue::Float(text.parse::<f64>().unwrap_or(as_i64 as f64)))
        }
    } else if value.is_string() {
        let string = value
            .to_string(scope)
            .ok_or_else(|| BridgeError::Conversion("Failed to convert string".to_string()))?;
        let rust_str = string.to_rust_string_lossy(scope);
        tracker.add_bytes(rust_str.len())?;
        Ok(JSValue::String(rust_str))
    } else if value.is_symbol() {
        tracker.add_bytes(8)?;
        Ok(JSValue::Unsupported("symbol".to_string()))
    } else if value.is_function() {
        tracker.add_bytes(8)?;
        Ok(JSValue::Unsupported("function".to_string()))
    } else if value.is_date() {
        tracker.add_bytes(8)?;
        let date = v8::Local::<v8::Date>::try_from(value)
            .map_err(|_| BridgeError::Conversion("Failed to cast to Date".to_string()))?;
        Ok(date_to_host(date.value_of()))
    } else if value.is_native_error() {
        let object = v8::Local::<v8::Object>::try_from(value)
            .map_err(|_| BridgeError::Conversion("Failed to cast error to object".to_string()))?;
        let error = error_to_host(scope, object)?;
        tracker.add_bytes(error.name.len() + error.message.len())?;
        Ok(JSValue::Error(error))
    } else if value.is_array() {
        let array = v8::Local::<v8::Array>::try_from(value)
            .map_err(|_| BridgeError::Conversion("Failed to cast to array".to_string()))?;
        let object: v8::Local<v8::Object> = array.into();
        enter_object(ancestors, object, "array")?;

        let len = array.length();
        tracker.add_bytes((len as usize).saturating_mul(std::mem::size_of::<usize>()))?;
        let mut items = Vec::with_capacity(len as usize);
        for index in 0..len {
            let item = array.get_index(scope, index).ok_or_else(|| {
                BridgeError::Conversion(format!("Failed to read array index {}", index))
            })?;
            items.push(to_host_internal(scope, item, ancestors, tracker)?);
        }

        ancestors.pop();
        Ok(JSValue::Array(items))
    } else if value.is_object() {
        let object = v8::Local::<v8::Object>::try_from(value)
            .map_err(|_| BridgeError::Conversion("Failed to cast to object".to_string()))?;
        enter_object(ancestors, object, "object")?;

        let names = object
            .get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
            .ok_or_else(|| BridgeError::Conversion("Failed to get property names".to_string()))?;

        let mut map = IndexMap::with_capacity(names.length() as usize);
        for index in 0..names.length() {
            let key = names.get_index(scope, index).ok_or_else(|| {
                BridgeError::Conversion("Failed to read property name".to_string())
            })?;
            let key_str = key
                .to_string(scope)
                .ok_or_else(|| BridgeError::Conversion("Failed to convert key".to_string()))?
                .to_rust_string_lossy(scope);
            // Getters run here, outside any evaluation deadline.
            let item = object.get(scope, key).ok_or_else(|| {
                BridgeError::Conversion(format!("Failed to read property '{}'", key_str))
            })?;

            tracker.add_bytes(key_str.len())?;
            let converted = to_host_internal(scope, item, ancestors, tracker)?;
            map.insert(key_str, converted);
        }

        ancestors.pop();
        Ok(JSValue::Object(map))
    } else {
        let string = value
            .to_string(scope)
            .ok_or_else(|| BridgeError::Conversion("Failed to convert value".to_string()))?;
        let rust_str = string.to_rust_string_lossy(scope);
        tracker.add_bytes(rust_str.len())?;
        Ok(JSValue::String(rust_str))
    };

    tracker.exit();
    result
}

/// Push `object` onto the visit chain, failing if it is already on it.
fn enter_object<'s>(
    ancestors: &mut Vec<v8::Local<'s, v8::Object>>,
    object: v8::Local<'s, v8::Object>,
    kind: &str,
) -> Result<(), BridgeError> {
    let hash = object.get_identity_hash();
    let value: v8::Local<v8::Value> = object.into();
    let cyclic = ancestors
        .iter()
        .any(|seen| seen.get_identity_hash() == hash && seen.strict_equals(value));
    if cyclic {
        return Err(BridgeError::CyclicValue(format!(
            "Cannot convert {} that contains itself",
            kind
        )));
    }
    ancestors.push(object);
    Ok(())
}

fn date_to_host(millis: f64) -> JSValue {
    if !millis.is_finite() {
        return JSValue::Null;
    }
    match DateTime::<Utc>::from_timestamp_millis(millis as i64) {
        Some(date) => JSValue::Date(date),
        None => JSValue::Null,
    }
}

fn read_string_property<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    name: &str,
) -> Option<String> {
    let key = v8::String::new(scope, name)?;
    let value = object.get(scope, key.into())?;
    if value.is_null_or_undefined() {
        return None;
    }
    Some(value.to_string(scope)?.to_rust_string_lossy(scope))
}

pub(crate) fn error_to_host<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
) -> Result<JsErrorValue, BridgeError> {
    let name = read_string_property(scope, object, "name").unwrap_or_else(|| "Error".to_string());
    let message = read_string_property(scope, object, "message").unwrap_or_default();
    let stack = read_string_property(scope, object, "stack");
    Ok(JsErrorValue {
        name,
        message,
        stack,
    })
}

fn new_string<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &str,
) -> Result<v8::Local<'s, v8::String>, BridgeError> {
    v8::String::new(scope, value).ok_or_else(|| {
        BridgeError::Allocation(format!("String of {} bytes is too large", value.len()))
    })
}

/// Build an engine error object, using the matching built-in constructor
/// for standard error names.
pub(crate) fn error_to_engine<'s>(
    scope: &mut v8::HandleScope<'s>,
    error: &JsErrorValue,
) -> Result<v8::Local<'s, v8::Value>, BridgeError> {
    let message = new_string(scope, &error.message)?;
    let exception = match error.name.as_str() {
        "TypeError" => v8::Exception::type_error(scope, message),
        "RangeError" => v8::Exception::range_error(scope, message),
        "ReferenceError" => v8::Exception::reference_error(scope, message),
        "SyntaxError" => v8::Exception::syntax_error(scope, message),
        "Error" => v8::Exception::error(scope, message),
        custom => {
            let exception = v8::Exception::error(scope, message);
            if let Ok(object) = v8::Local::<v8::Object>::try_from(exception) {
                let key = new_string(scope, "name")?;
                let name = new_string(scope, custom)?;
                object.set(scope, key.into(), name.into());
            }
            exception
        }
    };
    Ok(exception)
}

fn to_engine_internal<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &JSValue,
    tracker: &mut LimitTracker,
) -> Result<v8::Local<'s, v8::Value>, BridgeError> {
    tracker.enter()?;

    let result = match value {
        JSValue::Null => Ok(v8::null(scope).into()),
        JSValue::Bool(b) => Ok(v8::Boolean::new(scope, *b).into()),
        JSValue::Int(i) => match i32::try_from(*i) {
            Ok(small) => Ok(v8::Integer::new(scope, small).into()),
            // Beyond 2^53 this is approximate.
            Err(_) => Ok(v8::Number::new(scope, *i as f64).into()),
        },
        JSValue::Float(f) => Ok(v8::Number::new(scope, *f).into()),
        JSValue::String(s) => {
            tracker.add_bytes(s.len())?;
            Ok(new_string(scope, s)?.into())
        }
        JSValue::Array(items) => {
            let mut elements = Vec::with_capacity(items.len());
            for item in items {
                elements.push(to_engine_internal(scope, item, tracker)?);
            }
            Ok(v8::Array::new_with_elements(scope, &elements).into())
        }
        JSValue::Object(map) => {
            let object = v8::Object::new(scope);
            for (key, item) in map {
                tracker.add_bytes(key.len())?;
                let key = new_string(scope, key)?;
                let item = to_engine_internal(scope, item, tracker)?;
                // Data properties: keys like "__proto__" must not hit setters.
                object
                    .create_data_property(scope, key.into(), item)
                    .ok_or_else(|| {
                        BridgeError::Conversion("Failed to define object property".to_string())
                    })?;
            }
            Ok(object.into())
        }
        JSValue::Date(date) => v8::Date::new(scope, date.timestamp_millis() as f64)
            .map(Into::into)
            .ok_or_else(|| BridgeError::Conversion("Failed to create Date".to_string())),
        JSValue::Error(error) => error_to_engine(scope, error),
        JSValue::Unsupported(kind) => Err(BridgeError::UnsupportedValue(format!(
            "a {} returned from script cannot be passed back into it",
            kind
        ))),
    };

    tracker.exit();
    result
}
