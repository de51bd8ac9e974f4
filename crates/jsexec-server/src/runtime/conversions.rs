//! JSON <-> JavaScript Value Conversions
//!
//! Invocation arguments travel as strings and results travel back as a
//! string. In between, each argument that parses as JSON is handed to the
//! script as the decoded value (so `"41"` arrives as the number 41 and
//! `"{\"a\":1}"` as an object), and any argument that does not is passed as
//! the raw string.
//!
//! # Type Mapping
//!
//! | JSON Type | JavaScript Type |
//! |-----------|-----------------|
//! | null | null |
//! | boolean | Boolean |
//! | number | Number (integers stay integral) |
//! | string | String |
//! | array | Array |
//! | object | Object |
//!
//! Results are rendered as follows: strings verbatim, `undefined` as the empty
//! string, everything else as JSON. Functions and symbols render as `null`,
//! as do non-finite numbers.

use boa_engine::{
    js_string,
    object::{builtins::JsArray, JsObject},
    property::PropertyKey,
    value::JsValue,
    Context,
};
use serde_json::Value as JsonValue;

use crate::error::EngineError;

/// Nesting depth past which a result is rejected instead of rendered.
const MAX_RESULT_DEPTH: usize = 128;

/// Converts one wire argument into the value handed to the script.
pub fn decode_arg(raw: &str, ctx: &mut Context) -> Result<JsValue, EngineError> {
    match serde_json::from_str::<JsonValue>(raw) {
        Ok(json) => json_to_js_value(json, ctx),
        Err(_) => Ok(JsValue::new(js_string!(raw))),
    }
}

/// Renders a script's return value as the wire result string.
pub fn result_to_string(value: JsValue, ctx: &mut Context) -> Result<String, EngineError> {
    if value.is_undefined() {
        return Ok(String::new());
    }

    if let Some(s) = value.as_string() {
        return s
            .to_std_string()
            .map_err(|e| EngineError::runtime(format!("String conversion error: {:?}", e)));
    }

    let json = js_value_to_json(value, ctx, 0)?;
    serde_json::to_string(&json)
        .map_err(|e| EngineError::runtime(format!("Failed to serialize result: {}", e)))
}

/// Convert serde_json::Value to Boa JsValue.
///
/// # Errors
///
/// Fails if object property creation or an array push fails.
pub fn json_to_js_value(json: JsonValue, ctx: &mut Context) -> Result<JsValue, EngineError> {
    match json {
        JsonValue::Null => Ok(JsValue::null()),
        JsonValue::Bool(b) => Ok(JsValue::new(b)),
        JsonValue::Number(n) => {
            // Prefer the integer representation so `41 + 1` stays `42`
            if let Some(i) = n.as_i64() {
                Ok(JsValue::new(i))
            } else {
                n.as_f64()
                    .map(JsValue::new)
                    .ok_or_else(|| EngineError::runtime("Number out of range"))
            }
        }
        JsonValue::String(s) => Ok(JsValue::new(js_string!(s))),
        JsonValue::Array(arr) => {
            let js_array = JsArray::new(ctx);
            for (i, v) in arr.into_iter().enumerate() {
                let js_value = json_to_js_value(v, ctx)?;
                js_array.push(js_value, ctx).map_err(|e| {
                    EngineError::runtime(format!("Failed to push array element {}: {}", i, e))
                })?;
            }
            Ok(js_array.into())
        }
        JsonValue::Object(obj) => {
            let js_obj = JsObject::with_object_proto(ctx.intrinsics());

            for (key, value) in obj {
                let js_value = json_to_js_value(value, ctx)?;
                js_obj
                    .create_data_property_or_throw(js_string!(key.clone()), js_value, ctx)
                    .map_err(|e| {
                        EngineError::runtime(format!("Failed to set property '{}': {}", key, e))
                    })?;
            }

            Ok(js_obj.into())
        }
    }
}

/// Convert Boa JsValue to serde_json::Value.
///
/// Integral numbers within `i64` range become JSON integers, so a script
/// returning `42` renders as `42` rather than `42.0`.
///
/// # Errors
///
/// Fails when property access throws, a string is not valid UTF-16, or the
/// value nests deeper than [`MAX_RESULT_DEPTH`] (which includes cycles).
pub fn js_value_to_json(
    value: JsValue,
    ctx: &mut Context,
    depth: usize,
) -> Result<JsonValue, EngineError> {
    if depth > MAX_RESULT_DEPTH {
        return Err(EngineError::runtime(format!(
            "Result nests deeper than {} levels",
            MAX_RESULT_DEPTH
        )));
    }

    if value.is_undefined() || value.is_null() {
        return Ok(JsonValue::Null);
    }

    if let Some(b) = value.as_boolean() {
        return Ok(JsonValue::Bool(b));
    }

    if let Some(i) = value.as_i32() {
        return Ok(JsonValue::Number(i.into()));
    }

    if let Some(n) = value.as_number() {
        return Ok(number_to_json(n));
    }

    if let Some(s) = value.as_string() {
        return s
            .to_std_string()
            .map(JsonValue::String)
            .map_err(|e| EngineError::runtime(format!("String conversion error: {:?}", e)));
    }

    if let Some(obj) = value.as_object() {
        if obj.is_callable() {
            return Ok(JsonValue::Null);
        }

        if obj.is_array() {
            let array = JsArray::from_object(obj.clone())
                .map_err(|e| EngineError::runtime(format!("Object is not a valid array: {}", e)))?;

            let length: usize = array
                .length(ctx)
                .map_err(|e| EngineError::runtime(format!("Failed to get array length: {}", e)))?
                .try_into()
                .map_err(|_| EngineError::runtime("Array length overflow"))?;

            let mut result = Vec::with_capacity(length);
            for i in 0..length {
                let elem = array.get(i, ctx).map_err(|e| {
                    EngineError::runtime(format!("Failed to get array element {}: {}", i, e))
                })?;
                result.push(js_value_to_json(elem, ctx, depth + 1)?);
            }
            return Ok(JsonValue::Array(result));
        }

        let keys = obj
            .own_property_keys(ctx)
            .map_err(|e| EngineError::runtime(format!("Failed to get object keys: {}", e)))?;

        let mut result = serde_json::Map::new();
        for key in keys {
            let key_str = match &key {
                PropertyKey::String(s) => s
                    .to_std_string()
                    .map_err(|e| EngineError::runtime(format!("String conversion error: {:?}", e)))?,
                PropertyKey::Index(i) => i.get().to_string(),
                PropertyKey::Symbol(_) => continue,
            };

            let prop_value = obj.get(key.clone(), ctx).map_err(|e| {
                EngineError::runtime(format!("Failed to get property '{}': {}", key_str, e))
            })?;
            result.insert(key_str, js_value_to_json(prop_value, ctx, depth + 1)?);
        }

        return Ok(JsonValue::Object(result));
    }

    // Symbols and anything else without a JSON form
    Ok(JsonValue::Null)
}

fn number_to_json(n: f64) -> JsonValue {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        return JsonValue::Number((n as i64).into());
    }
    serde_json::Number::from_f64(n)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}
