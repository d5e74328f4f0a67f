use async_trait::async_trait;
use relay_common::{RemoteCommandMessage, StreamMessage};
use relay_pubsub::{BroadcastHandler, ErrorSink, Subscriber};

use crate::Error;

/// Loops broadcasts and commands straight back to the local handler.
#[derive(Clone, Debug)]
pub struct LegacySubscriber<H> {
    handler: H,
}

impl<H: BroadcastHandler> LegacySubscriber<H> {
    /// Creates a subscriber delivering to `handler`.
    pub const fn new(handler: H) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<H: BroadcastHandler> Subscriber for LegacySubscriber<H> {
    type Error = Error;

    async fn start(&self, _errors: ErrorSink<Self::Error>) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn subscribe(&self, _stream: &str) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn unsubscribe(&self, _stream: &str) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn broadcast(&self, message: &StreamMessage) -> Result<(), Self::Error> {
        self.handler
            .broadcast(message.clone())
            .await
            .map_err(|e| Error::Handler(e.to_string()))
    }

    async fn broadcast_command(&self, command: &RemoteCommandMessage) -> Result<(), Self::Error> {
        self.handler
            .execute_remote_command(command.clone())
            .await
            .map_err(|e| Error::Handler(e.to_string()))
    }

    fn is_multi_node(&self) -> bool {
        false
    }
}
