//! Canonical string coercion for assertion comparison and saved variables.

use serde_json::Value;

/// Coerce a JSON value to its canonical string form.
///
/// Both sides of an assertion comparison and every saved variable pass
/// through this function, so equality is stringwise and stable: integers have
/// no trailing `.0`, floats drop trailing zeros, booleans are lower-case, and
/// composite values fall back to compact JSON.
pub fn canonical_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => canonical_number(number),
        Value::String(text) => text.clone(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn canonical_number(number: &serde_json::Number) -> String {
    if let Some(integer) = number.as_i64() {
        return integer.to_string();
    }
    if let Some(unsigned) = number.as_u64() {
        return unsigned.to_string();
    }
    match number.as_f64() {
        Some(float) if float.fract() == 0.0 && float.abs() < 1e15 => {
            format!("{}", float as i64)
        }
        Some(float) => format!("{float}"),
        None => number.to_string(),
    }
}
