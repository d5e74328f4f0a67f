use relay_common::PubSubMessage;
use thiserror::Error;
use tracing::debug;

use crate::{BroadcastHandler, HandlerError};

/// Why a raw backend payload could not be dispatched.
#[derive(Debug, Error)]
pub enum DispatchError<E: HandlerError> {
    /// The payload cannot be decoded and will never be.
    #[error("malformed payload: {0}")]
    Decode(#[from] relay_common::Error),

    /// The handler failed; the payload may succeed on redelivery.
    #[error("handler failed: {0}")]
    Handler(#[source] E),
}

/// Decodes a raw backend payload and routes it to `handler`.
///
/// Batches are delivered message by message and stop at the first failure.
///
/// # Errors
///
/// Returns [`DispatchError::Decode`] for malformed payloads and
/// [`DispatchError::Handler`] when the handler fails.
pub async fn dispatch_payload<H: BroadcastHandler>(
    handler: &H,
    raw: &[u8],
) -> Result<(), DispatchError<H::Error>> {
    dispatch_message(handler, PubSubMessage::from_json(raw)?).await
}

/// Routes a decoded payload to `handler`.
///
/// # Errors
///
/// Returns [`DispatchError::Handler`] when the handler fails.
pub async fn dispatch_message<H: BroadcastHandler>(
    handler: &H,
    message: PubSubMessage,
) -> Result<(), DispatchError<H::Error>> {
    match message {
        PubSubMessage::Stream(message) => {
            debug!(stream = %message.stream, "incoming broadcast");
            handler
                .broadcast(message)
                .await
                .map_err(DispatchError::Handler)
        }
        PubSubMessage::Batch(messages) => {
            debug!(size = messages.len(), "incoming broadcast batch");
            for message in messages {
                handler
                    .broadcast(message)
                    .await
                    .map_err(DispatchError::Handler)?;
            }
            Ok(())
        }
        PubSubMessage::Command(command) => {
            debug!(command = %command.command, "incoming remote command");
            handler
                .execute_remote_command(command)
                .await
                .map_err(DispatchError::Handler)
        }
    }
}
