use async_trait::async_trait;
use relay_common::{DISCONNECT_COMMAND, RemoteCommandMessage, StreamMessage};
use relay_hub::{Encoder, Hub, Session};
use relay_pubsub::BroadcastHandler;
use tracing::{debug, warn};

use crate::Error;

/// Feeds what the pub/sub backend receives into the local hub.
pub struct HubHandler<S, E> {
    hub: Hub<S, E>,
}

impl<S, E> Clone for HubHandler<S, E> {
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
        }
    }
}

impl<S: Session, E: Encoder> HubHandler<S, E> {
    /// Creates a handler delivering to `hub`.
    pub const fn new(hub: Hub<S, E>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl<S: Session, E: Encoder> BroadcastHandler for HubHandler<S, E> {
    type Error = Error;

    async fn broadcast(&self, message: StreamMessage) -> Result<(), Self::Error> {
        self.hub.broadcast_message(message).await?;
        Ok(())
    }

    async fn execute_remote_command(
        &self,
        command: RemoteCommandMessage,
    ) -> Result<(), Self::Error> {
        if command.command != DISCONNECT_COMMAND {
            warn!(command = %command.command, "unknown remote command");
            return Ok(());
        }

        let disconnect = match command.to_remote_disconnect() {
            Ok(disconnect) => disconnect,
            Err(error) => {
                warn!(%error, "malformed remote disconnect");
                return Ok(());
            }
        };

        debug!(identity = %disconnect.identifier, "remote disconnect");
        self.hub
            .remote_disconnect(&disconnect.identifier, disconnect.reconnect)
            .await?;

        Ok(())
    }
}
