use relay_pubsub::SubscriberError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The handler rejected a message.
    #[error("handler error: {0}")]
    Handler(String),

    /// The subscriber has been shut down.
    #[error("subscriber has been shut down")]
    Shutdown,
}

impl SubscriberError for Error {}
