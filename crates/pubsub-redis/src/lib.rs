//! Redis Streams backend.
//!
//! A [`Streamer`] consumes one stream as a member of a consumer group:
//! entries are delivered to exactly one live consumer, acknowledged once
//! handled, and claimed by another consumer if their owner dies first.
//! [`RedisSubscriber`] builds the cluster broadcast channel from two of
//! them: a shared group taking published payloads in, and a group per
//! instance reading the fan-out stream.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod backend;
mod config;
mod error;
mod handler;
mod streamer;
mod subscriber;

pub use backend::redis::{RedisConnection, RedisConnector};
pub use backend::{Connector, GroupCreated, PAYLOAD_FIELD, StreamConnection, StreamEntry};
pub use config::{
    GroupMembership, ReconnectPolicy, RedisConfig, RedisSubscriberConfig, StreamerConfig,
};
pub use error::Error;
pub use handler::{StreamHandler, StreamHandlerError};
pub use streamer::{Streamer, StreamerState};
pub use subscriber::RedisSubscriber;

#[cfg(any(test, feature = "test-helpers"))]
pub use backend::memory::{MemoryConnection, MemoryConnector, MemoryStreams};
