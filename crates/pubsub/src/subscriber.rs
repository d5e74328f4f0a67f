use std::error::Error;

use async_trait::async_trait;
use relay_common::{RemoteCommandMessage, StreamMessage};
use tokio::sync::mpsc;

/// Marker trait for subscriber errors.
pub trait SubscriberError: Error + Send + Sync + 'static {}

/// Channel on which a running subscriber reports terminal failures.
pub type ErrorSink<E> = mpsc::Sender<E>;

/// A pub/sub backend connecting server instances.
#[async_trait]
pub trait Subscriber
where
    Self: Send + Sync + 'static,
{
    /// The error type for the subscriber.
    type Error: SubscriberError;

    /// Connects to the backend and starts delivering to the handler.
    ///
    /// Failures after a successful start are reported on `errors`; a failure
    /// sent there means the subscriber has stopped for good.
    async fn start(&self, errors: ErrorSink<Self::Error>) -> Result<(), Self::Error>;

    /// Stops delivery and releases backend resources.
    ///
    /// Returns within a bounded time. Backends talking to a remote server
    /// give up after their configured shutdown timeout and report it as an
    /// error; callers needing a tighter deadline wrap the call in
    /// [`tokio::time::timeout`].
    async fn shutdown(&self) -> Result<(), Self::Error>;

    /// Starts receiving messages published to `stream`.
    async fn subscribe(&self, stream: &str) -> Result<(), Self::Error>;

    /// Stops receiving messages published to `stream`.
    async fn unsubscribe(&self, stream: &str) -> Result<(), Self::Error>;

    /// Publishes a stream message.
    async fn broadcast(&self, message: &StreamMessage) -> Result<(), Self::Error>;

    /// Publishes a remote command.
    async fn broadcast_command(&self, command: &RemoteCommandMessage) -> Result<(), Self::Error>;

    /// Whether messages published here reach every subscribed node.
    fn is_multi_node(&self) -> bool;
}
