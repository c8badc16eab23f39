use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::key::{HashFunction, KeyExtraction};
use crate::model::DataRecord;

pub const LAMBDA_FUNCTION_NAME_ENV: &str = "AWS_LAMBDA_FUNCTION_NAME";
pub const IDEMPOTENCY_DISABLED_ENV: &str = "POWERTOOLS_IDEMPOTENCY_DISABLED";

const DEFAULT_FUNCTION_NAME: &str = "testFunction";
const DEFAULT_EXPIRATION: Duration = Duration::from_secs(60 * 60);
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Transform applied to a replayed response before it is returned.
pub type ResponseHook = Arc<dyn Fn(Value, &DataRecord) -> Value + Send + Sync>;

/// Configuration for an [`IdempotencyHandler`](crate::IdempotencyHandler)
#[derive(Clone)]
pub struct IdempotencyConfig {
    /// Part of the payload identifying the request
    pub event_key: KeyExtraction,
    /// Part of the payload whose hash must match on replay
    pub payload_validation: Option<KeyExtraction>,
    /// Time-to-live of records
    pub expiration: Duration,
    pub throw_on_no_idempotency_key: bool,
    pub hash_function: HashFunction,
    /// Extra attempts when the store returns inconsistent results
    pub max_retries: u32,
    pub response_hook: Option<ResponseHook>,
    /// Namespace prepended to every idempotency key
    pub function_name: String,
    /// Skip idempotency altogether and run the function
    pub disabled: bool,
    pub clock: Arc<dyn Clock>,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            event_key: KeyExtraction::Whole,
            payload_validation: None,
            expiration: DEFAULT_EXPIRATION,
            throw_on_no_idempotency_key: false,
            hash_function: HashFunction::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            response_hook: None,
            function_name: DEFAULT_FUNCTION_NAME.to_string(),
            disabled: false,
            clock: Arc::new(SystemClock),
        }
    }
}

impl IdempotencyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the function name and the kill switch from the Lambda environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let function_name = lookup(LAMBDA_FUNCTION_NAME_ENV)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_FUNCTION_NAME.to_string());
        let disabled = lookup(IDEMPOTENCY_DISABLED_ENV)
            .is_some_and(|value| !value.eq_ignore_ascii_case("false"));

        Self {
            function_name,
            disabled,
            ..Self::default()
        }
    }

    pub fn with_event_key(mut self, event_key: KeyExtraction) -> Self {
        self.event_key = event_key;
        self
    }

    pub fn with_payload_validation(mut self, validation: KeyExtraction) -> Self {
        self.payload_validation = Some(validation);
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_throw_on_no_idempotency_key(mut self, throw: bool) -> Self {
        self.throw_on_no_idempotency_key = throw;
        self
    }

    pub fn with_hash_function(mut self, hash_function: HashFunction) -> Self {
        self.hash_function = hash_function;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_response_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(Value, &DataRecord) -> Value + Send + Sync + 'static,
    {
        self.response_hook = Some(Arc::new(hook));
        self
    }

    pub fn with_function_name(mut self, function_name: impl Into<String>) -> Self {
        self.function_name = function_name.into();
        self
    }

    /// Scope keys to one handler within the function, as `{function}.{handler}`.
    pub fn with_handler_name(mut self, handler_name: &str) -> Self {
        if !handler_name.is_empty() {
            self.function_name = format!("{}.{}", self.function_name, handler_name);
        }
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl fmt::Debug for IdempotencyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyConfig")
            .field("event_key", &self.event_key)
            .field("payload_validation", &self.payload_validation)
            .field("expiration", &self.expiration)
            .field("throw_on_no_idempotency_key", &self.throw_on_no_idempotency_key)
            .field("hash_function", &self.hash_function)
            .field("max_retries", &self.max_retries)
            .field("response_hook", &self.response_hook.is_some())
            .field("function_name", &self.function_name)
            .field("disabled", &self.disabled)
            .finish_non_exhaustive()
    }
}
