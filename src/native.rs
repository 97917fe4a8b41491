// File: src/native.rs
//
// Native function bindings exposed to Ember scripts.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::value::Value;

/// `clock()` — seconds since an unspecified epoch, as a number.
pub fn clock(_args: &[Value]) -> Result<Value, String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| e.to_string())?;
    Ok(Value::Number(now.as_secs_f64()))
}
