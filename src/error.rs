use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum Error {
    /// A live record already holds the idempotency key.
    #[error("Idempotency record already exists for key: {0}")]
    ItemAlreadyExists(String),

    #[error("Idempotency record not found for key: {0}")]
    ItemNotFound(String),

    /// Two reads of the persistence store disagreed. Retried by the handler.
    #[error("Inconsistent idempotency state: {0}")]
    InconsistentState(String),

    #[error("Execution already in progress with idempotency key: {0}")]
    AlreadyInProgress(String),

    #[error("Payload does not match stored record for this event key")]
    Validation,

    #[error("No data found to create a hashed idempotency key")]
    KeyMissing,

    #[error("{message}")]
    PersistenceLayer {
        message: String,
        #[source]
        source: BoxError,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("DynamoDB error: {0}")]
    DynamoDb(String),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn persistence(message: impl Into<String>, source: Error) -> Self {
        Error::PersistenceLayer {
            message: message.into(),
            source: Box::new(source),
        }
    }

    /// Whether the caller may try the same invocation again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::AlreadyInProgress(_) | Error::InconsistentState(_)
        )
    }
}

impl From<aws_sdk_dynamodb::Error> for Error {
    fn from(err: aws_sdk_dynamodb::Error) -> Self {
        Error::DynamoDb(err.to_string())
    }
}

impl<E> From<aws_sdk_dynamodb::error::SdkError<E>> for Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: aws_sdk_dynamodb::error::SdkError<E>) -> Self {
        Error::DynamoDb(aws_sdk_dynamodb::error::DisplayErrorContext(&err).to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Encoding(err.to_string())
    }
}
