//! Powertools idempotency - run AWS Lambda handlers at most once per request
//!
//! Wraps a handler function so that repeated invocations carrying the same
//! payload key run the function once and replay its stored response. Ownership
//! of a key is claimed with a conditional write against a shared persistence
//! store (DynamoDB, Redis, or in memory), which resolves races between
//! concurrent invocations, possibly on different hosts.
//!
//! # Example
//!
//! ```no_run
//! use powertools_idempotency::{
//!     DynamoDbPersistenceStore, Error, IdempotencyConfig, IdempotencyHandler, KeyExtraction,
//! };
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Initialize AWS DynamoDB client
//! let aws_config = aws_config::load_from_env().await;
//! let dynamodb_client = aws_sdk_dynamodb::Client::new(&aws_config);
//!
//! // Create persistence layer
//! let store = Arc::new(
//!     DynamoDbPersistenceStore::builder()
//!         .table_name("idempotency")
//!         .client(dynamodb_client)
//!         .build()?,
//! );
//!
//! // Key requests on the order id, records live for one hour
//! let config = IdempotencyConfig::from_env()
//!     .with_event_key(KeyExtraction::path("/order_id")?)
//!     .with_expiration(Duration::from_secs(3600));
//!
//! let idempotency = IdempotencyHandler::new(store, config);
//!
//! let event = json!({"order_id": "42", "amount": 12});
//! let response: Value = idempotency
//!     .handle_with_remaining_time(&event, Duration::from_secs(30), || async {
//!         // Your processing logic here
//!         Ok::<_, Error>(json!({"status": "charged"}))
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

// No-op macros when tracing is disabled
#[cfg(not(feature = "tracing"))]
macro_rules! debug {
    ($($tt:tt)*) => {{}};
}
#[cfg(not(feature = "tracing"))]
macro_rules! info {
    ($($tt:tt)*) => {{}};
}
#[cfg(not(feature = "tracing"))]
macro_rules! warn {
    ($($tt:tt)*) => {{}};
}
#[cfg(not(feature = "tracing"))]
macro_rules! error {
    ($($tt:tt)*) => {{}};
}

pub mod clock;
pub mod config;
pub mod dynamodb;
pub mod error;
pub mod handler;
pub mod in_memory;
pub mod key;
pub mod model;
pub mod persistence;
pub mod record_store;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod serdes;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{IdempotencyConfig, ResponseHook};
pub use dynamodb::DynamoDbPersistenceStore;
pub use error::Error;
pub use handler::{Claim, IdempotencyHandler, Outcome};
pub use in_memory::InMemoryPersistenceStore;
pub use key::{HashFunction, JsonPath, KeyExtraction};
pub use model::{DataRecord, RecordStatus, Status};
pub use persistence::PersistenceStore;
pub use powertools_idempotency_macros::idempotent;
#[cfg(feature = "redis")]
pub use redis_store::RedisPersistenceStore;

#[doc(hidden)]
pub mod __private {
    pub use serde_json;
}
