use relay_pubsub::SubscriberError;
use thiserror::Error;

/// Errors that can occur when consuming or publishing through Redis streams.
#[derive(Debug, Error)]
pub enum Error {
    /// Redis returned an error or the connection failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The backend connection is gone or could not be established.
    #[error("backend error: {0}")]
    Backend(String),

    /// Redis answered with a reply of an unexpected shape.
    #[error("unexpected reply to {command}: {details}")]
    Protocol {
        /// Command that got the reply.
        command: &'static str,
        /// What was wrong with it.
        details: String,
    },

    /// The configuration cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The consumer gave up after failing too many times in a row.
    #[error("reconnect attempts exceeded ({attempts}): {last_error}")]
    ReconnectAttemptsExceeded {
        /// Number of consecutive failures.
        attempts: u32,
        /// The last failure.
        last_error: String,
    },

    /// The streamer has already been started.
    #[error("streamer already started")]
    AlreadyStarted,

    /// Shutting down took longer than allowed.
    #[error("shutdown did not finish within {0:?}")]
    ShutdownTimeout(std::time::Duration),

    /// A stream entry handler failed.
    #[error("handler error: {0}")]
    Handler(String),

    /// A payload could not be encoded.
    #[error(transparent)]
    Payload(#[from] relay_common::Error),
}

impl Error {
    /// Configuration problems are never retried.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidConfig(_))
    }
}

impl SubscriberError for Error {}
