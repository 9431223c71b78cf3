//! Conversions between yrs values and plain Rust / JSON values.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use yrs::{Any, Out};

use crate::AppError;

pub(crate) fn string(out: Option<Out>) -> Option<String> {
    match out? {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

pub(crate) fn boolean(out: Option<Out>) -> Option<bool> {
    match out? {
        Out::Any(Any::Bool(b)) => Some(b),
        _ => None,
    }
}

pub(crate) fn number(out: Option<Out>) -> Option<f64> {
    match out? {
        Out::Any(Any::Number(n)) => Some(n),
        Out::Any(Any::BigInt(n)) => Some(n as f64),
        _ => None,
    }
}

/// Milliseconds stored as a JS-style number.
pub(crate) fn millis(out: Option<Out>) -> Option<u64> {
    number(out).filter(|n| *n >= 0.0).map(|n| n as u64)
}

pub(crate) fn any(out: Option<Out>) -> Option<Any> {
    match out? {
        Out::Any(any) => Some(any),
        _ => None,
    }
}

pub(crate) fn to_any<T: Serialize>(value: &T) -> Result<Any, AppError> {
    Ok(serde_json::from_value(serde_json::to_value(value)?)?)
}

pub(crate) fn json_to_any(value: &Value) -> Result<Any, AppError> {
    Ok(serde_json::from_value(value.clone())?)
}

pub(crate) fn any_to_json(any: &Any) -> Option<Value> {
    serde_json::to_value(any).ok()
}

/// Decodes a structured value stored as a plain map or array.
pub(crate) fn decode<T: DeserializeOwned>(out: Option<Out>) -> Option<T> {
    let value = any_to_json(&any(out)?)?;
    serde_json::from_value(value).ok()
}
