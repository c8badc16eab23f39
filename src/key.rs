//! Derivation of idempotency keys and validation hashes from JSON payloads.

use md5::Md5;
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::sync::Arc;

use crate::Error;

/// Custom extraction function for [`KeyExtraction::Custom`].
pub type ExtractFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// A JSON Pointer (RFC 6901) into the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    pointer: String,
    json_decoded: bool,
}

impl JsonPath {
    /// Parse a pointer such as `/body/order_id`. The empty pointer selects the whole payload.
    pub fn new(pointer: impl Into<String>) -> Result<Self, Error> {
        let pointer = pointer.into();
        if !pointer.is_empty() && !pointer.starts_with('/') {
            return Err(Error::Configuration(format!(
                "Invalid JSON pointer '{pointer}': must be empty or start with '/'"
            )));
        }
        Ok(Self {
            pointer,
            json_decoded: false,
        })
    }

    /// Parse string values met along the pointer as embedded JSON.
    ///
    /// API Gateway and SQS deliver their bodies as JSON encoded strings, so
    /// `/body/id` selects `id` inside the decoded body.
    pub fn json_decoded(mut self) -> Self {
        self.json_decoded = true;
        self
    }

    pub fn pointer(&self) -> &str {
        &self.pointer
    }

    pub fn search(&self, payload: &Value) -> Value {
        if !self.json_decoded {
            return payload.pointer(&self.pointer).cloned().unwrap_or(Value::Null);
        }

        let mut current = decode_embedded(payload.clone());
        for token in self.tokens() {
            let next = match &current {
                Value::Object(fields) => fields.get(&token).cloned(),
                Value::Array(items) => token
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| items.get(index).cloned()),
                _ => None,
            };
            match next {
                Some(value) => current = decode_embedded(value),
                None => return Value::Null,
            }
        }
        current
    }

    /// Reference tokens of the pointer, unescaped (RFC 6901 §4)
    fn tokens(&self) -> impl Iterator<Item = String> + '_ {
        self.pointer
            .split('/')
            .skip(1)
            .map(|token| token.replace("~1", "/").replace("~0", "~"))
    }
}

fn decode_embedded(value: Value) -> Value {
    if let Value::String(s) = &value {
        if let Ok(decoded) = serde_json::from_str::<Value>(s) {
            return decoded;
        }
    }
    value
}

/// How to select the part of a payload that identifies a request.
#[derive(Clone, Default)]
pub enum KeyExtraction {
    #[default]
    Whole,
    Path(JsonPath),
    /// Several paths collected into a JSON array, in order.
    Paths(Vec<JsonPath>),
    Custom(ExtractFn),
}

impl KeyExtraction {
    pub fn path(pointer: impl Into<String>) -> Result<Self, Error> {
        Ok(Self::Path(JsonPath::new(pointer)?))
    }

    pub fn paths<I, S>(pointers: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths = pointers
            .into_iter()
            .map(JsonPath::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::Paths(paths))
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    pub fn extract(&self, payload: &Value) -> Value {
        match self {
            Self::Whole => payload.clone(),
            Self::Path(path) => path.search(payload),
            Self::Paths(paths) => Value::Array(paths.iter().map(|p| p.search(payload)).collect()),
            Self::Custom(f) => f(payload),
        }
    }
}

impl fmt::Debug for KeyExtraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Whole => f.write_str("Whole"),
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Paths(paths) => f.debug_tuple("Paths").field(paths).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashFunction {
    #[default]
    Md5,
    Sha256,
    Sha512,
}

impl HashFunction {
    pub fn digest_hex(&self, data: &[u8]) -> String {
        match self {
            Self::Md5 => hex::encode(Md5::digest(data)),
            Self::Sha256 => hex::encode(Sha256::digest(data)),
            Self::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }
}

impl std::str::FromStr for HashFunction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "").as_str() {
            "MD5" => Ok(Self::Md5),
            "SHA256" => Ok(Self::Sha256),
            "SHA512" => Ok(Self::Sha512),
            _ => Err(Error::Configuration(format!("Unsupported hash function '{s}'"))),
        }
    }
}

/// Hash a JSON value: strings by their raw text, everything else by its compact JSON.
pub fn hash_value(hash_function: HashFunction, value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    hash_function.digest_hex(text.as_bytes())
}

/// A selection carries no key when it is null or a container of nulls.
pub fn is_missing_key(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.iter().all(Value::is_null),
        Value::Object(fields) => fields.values().all(Value::is_null),
        _ => false,
    }
}
