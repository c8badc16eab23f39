//! Encoding of function responses stored in idempotency records.
//!
//! `String` responses are stored as-is and replayed without JSON parsing, so
//! records stay readable by other Powertools runtimes. Every other type goes
//! through `serde_json`.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::any::{Any, TypeId};

use crate::Error;

fn is_string<T: 'static>() -> bool {
    TypeId::of::<T>() == TypeId::of::<String>()
}

/// Fail early for functions that produce nothing worth replaying.
pub fn ensure_replayable<T: 'static>() -> Result<(), Error> {
    if TypeId::of::<T>() == TypeId::of::<()>() {
        return Err(Error::Configuration(
            "The function doesn't return anything. Unable to perform idempotency on unit return type"
                .to_string(),
        ));
    }
    Ok(())
}

pub fn encode_response<T>(value: &T) -> Result<String, Error>
where
    T: Serialize + 'static,
{
    if let Some(raw) = (value as &dyn Any).downcast_ref::<String>() {
        return Ok(raw.clone());
    }
    Ok(serde_json::to_string(value)?)
}

/// The stored response as a JSON value, as handed to response hooks.
pub fn response_value<T: 'static>(raw: &str) -> Result<Value, Error> {
    if is_string::<T>() {
        return Ok(Value::String(raw.to_string()));
    }
    serde_json::from_str(raw).map_err(|e| Error::Decoding(e.to_string()))
}

pub fn decode_response<T>(raw: &str) -> Result<T, Error>
where
    T: DeserializeOwned + 'static,
{
    if is_string::<T>() {
        return downcast(raw.to_string());
    }
    serde_json::from_str(raw).map_err(|e| Error::Decoding(e.to_string()))
}

pub fn decode_value<T>(value: Value) -> Result<T, Error>
where
    T: DeserializeOwned + 'static,
{
    if is_string::<T>() {
        return match value {
            Value::String(raw) => downcast(raw),
            other => downcast(other.to_string()),
        };
    }
    serde_json::from_value(value).map_err(|e| Error::Decoding(e.to_string()))
}

fn downcast<T: 'static>(raw: String) -> Result<T, Error> {
    let boxed: Box<dyn Any> = Box::new(raw);
    boxed
        .downcast::<T>()
        .map(|value| *value)
        .map_err(|_| Error::Internal("Response type is not a String".to_string()))
}
