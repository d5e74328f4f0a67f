//! Messages exchanged between pub/sub backends, the hub and client sessions.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod message;
mod pubsub;
mod reply;

pub use error::Error;
pub use message::{
    DISCONNECT_COMMAND, RemoteCommandMessage, RemoteDisconnectMessage, StreamMessage,
    StreamMessageMetadata,
};
pub use pubsub::PubSubMessage;
pub use reply::{DisconnectMessage, REMOTE_DISCONNECT_REASON, Reply};
