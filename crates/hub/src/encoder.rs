use std::error::Error;

use bytes::Bytes;
use relay_common::{DisconnectMessage, Reply, StreamMessage};

/// Marker trait for encoder errors.
pub trait EncoderError: Error + Send + Sync + 'static {}

impl EncoderError for relay_common::Error {}

/// Renders messages in the client wire format.
///
/// Encoders are stateless; the hub caches renderings per broadcast.
pub trait Encoder: Send + Sync + 'static {
    /// The error type for the encoder.
    type Error: EncoderError;

    /// Renders a stream message addressed to one channel identifier.
    fn encode_broadcast(
        &self,
        message: &StreamMessage,
        identifier: &str,
    ) -> Result<Bytes, Self::Error>;

    /// Renders a disconnect notification.
    fn encode_disconnect(&self, message: &DisconnectMessage) -> Result<Bytes, Self::Error>;
}

/// JSON wire format.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    type Error = relay_common::Error;

    fn encode_broadcast(
        &self,
        message: &StreamMessage,
        identifier: &str,
    ) -> Result<Bytes, Self::Error> {
        Ok(Reply::for_identifier(message, identifier)?.to_json()?.into())
    }

    fn encode_disconnect(&self, message: &DisconnectMessage) -> Result<Bytes, Self::Error> {
        Ok(message.to_json()?.into())
    }
}
