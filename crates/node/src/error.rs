use relay_pubsub::{HandlerError, SubscriberError};
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Hub error.
    #[error(transparent)]
    Hub(#[from] relay_hub::Error),

    /// In-process pub/sub error.
    #[error(transparent)]
    Memory(#[from] relay_pubsub_memory::Error),

    /// Redis pub/sub error.
    #[error(transparent)]
    Redis(#[from] relay_pubsub_redis::Error),

    /// A message could not be encoded or decoded.
    #[error(transparent)]
    Payload(#[from] relay_common::Error),

    /// The node has already been started.
    #[error("node already started")]
    AlreadyStarted,
}

impl HandlerError for Error {}

impl SubscriberError for Error {}
