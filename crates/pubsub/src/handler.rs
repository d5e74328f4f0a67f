use std::convert::Infallible;
use std::error::Error;

use async_trait::async_trait;
use relay_common::{RemoteCommandMessage, StreamMessage};

/// Marker trait for broadcast handler errors.
pub trait HandlerError: Error + Send + Sync + 'static {}

impl HandlerError for Infallible {}

/// Receives what a subscriber picked up from its backend.
#[async_trait]
pub trait BroadcastHandler
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for the handler.
    type Error: HandlerError;

    /// Delivers a stream message locally.
    async fn broadcast(&self, message: StreamMessage) -> Result<(), Self::Error>;

    /// Executes a cluster-wide command locally.
    async fn execute_remote_command(
        &self,
        command: RemoteCommandMessage,
    ) -> Result<(), Self::Error>;
}
