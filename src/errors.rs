use std::str::FromStr;

use thiserror::Error;

/// Error types for SQS listener operations.
///
/// This enum represents all possible errors that can occur while wiring,
/// starting and running a listener container, and while talking to the
/// underlying queue service.
#[derive(Debug, Clone, Error)]
pub enum SqsListenerError {
    /// Error that occurs during SQS client initialization.
    ///
    /// This error typically happens when there are issues with AWS credentials,
    /// region configuration, or network connectivity during client setup.
    #[error("failed to initialize AWS SQS client: {0}")]
    InitializationError(String),

    /// Invalid listener or container configuration. Always fatal at startup.
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    /// More than one handler was registered for the same queue.
    #[error("more than one handler registered for queue '{queue}'")]
    DuplicateHandler { queue: String },

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// The receipt handle was already used for a delete or its visibility
    /// timeout expired.
    #[error("receipt handle is invalid or expired: {0}")]
    InvalidReceiptHandle(String),

    /// Network failures, throttling and server-side errors worth retrying.
    #[error("transient error during {operation}: {message}")]
    Transient {
        operation: &'static str,
        message: String,
    },

    #[error("queue service error during {operation} ({code}): {message}")]
    ServiceError {
        operation: &'static str,
        code: String,
        message: String,
    },

    /// The message payload could not be converted for its handler.
    #[error("failed to deserialize message payload: {0}")]
    DeserializationError(String),

    /// A handler reported failure for a message.
    #[error("handler failed: {0}")]
    HandlerError(String),

    /// An operation was attempted in the wrong container lifecycle state.
    #[error("container is {actual}, operation requires {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("{0}")]
    GenericError(#[from] GenericError),
}

impl SqsListenerError {
    /// Returns `true` when the failed operation may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns `true` for errors that must abort container startup.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::ConfigurationError(_) | Self::DuplicateHandler { .. } | Self::QueueNotFound(_)
        )
    }

    /// Convenience constructor for handler failures.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::HandlerError(message.into())
    }
}

impl From<serde_json::Error> for SqsListenerError {
    fn from(err: serde_json::Error) -> Self {
        SqsListenerError::DeserializationError(err.to_string())
    }
}

/// Generic error type for handling unexpected errors.
#[derive(Debug, Clone, Error)]
pub struct GenericError(String);

impl GenericError {
    /// Creates a new `GenericError` with the provided message.
    pub fn new(message: String) -> Self {
        GenericError(message)
    }
}

impl std::fmt::Display for GenericError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GenericError {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(GenericError::new(s.to_string()))
    }
}

impl From<String> for GenericError {
    fn from(s: String) -> Self {
        GenericError::new(s)
    }
}
