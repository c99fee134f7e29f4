use std::time::Duration;

use thiserror::Error;

/// Errors raised by an event channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The topic was never declared.
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// The queue was never declared.
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// A handler is already consuming this queue.
    #[error("Queue {0} already has a subscriber")]
    AlreadySubscribed(String),

    /// The broker did not acknowledge the publish in time.
    #[error("Publish not acknowledged within {0:?}")]
    PublishTimeout(Duration),

    /// The broker rejected the publish or the connection failed.
    #[error("Broker error: {0}")]
    Broker(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChannelError {
    /// Broker hiccups may succeed on redelivery; topology mistakes will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::PublishTimeout(_) | ChannelError::Broker(_))
    }
}

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Failure returned by a message handler.
///
/// Transient failures are retried by [`crate::RetryPolicy`]; permanent ones
/// go straight to the dead-letter queue.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(msg: impl std::fmt::Display) -> Self {
        HandlerError::Transient(msg.to_string())
    }

    pub fn permanent(msg: impl std::fmt::Display) -> Self {
        HandlerError::Permanent(msg.to_string())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

impl From<ChannelError> for HandlerError {
    fn from(err: ChannelError) -> Self {
        if err.is_transient() {
            HandlerError::Transient(err.to_string())
        } else {
            HandlerError::Permanent(err.to_string())
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Permanent(format!("malformed message: {err}"))
    }
}
