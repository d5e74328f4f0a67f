use serde_json::Value;

use crate::{Error, RemoteCommandMessage, StreamMessage};

/// A payload travelling through a pub/sub backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PubSubMessage {
    /// A single stream message.
    Stream(StreamMessage),

    /// Several stream messages published at once.
    Batch(Vec<StreamMessage>),

    /// A remote command.
    Command(RemoteCommandMessage),
}

impl PubSubMessage {
    /// Decodes a backend payload.
    ///
    /// Objects carrying a `command` key are commands, other objects are stream
    /// messages and arrays are batches.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid JSON or matches none of
    /// the supported shapes.
    pub fn from_json(raw: &[u8]) -> Result<Self, Error> {
        let value: Value = serde_json::from_slice(raw)?;

        match value {
            Value::Array(_) => Ok(Self::Batch(serde_json::from_value(value)?)),
            Value::Object(ref fields) if fields.contains_key("command") => {
                // Re-read from the raw bytes so the payload keeps its exact text.
                Ok(Self::Command(serde_json::from_slice(raw)?))
            }
            Value::Object(_) => Ok(Self::Stream(serde_json::from_value(value)?)),
            _ => Err(Error::UnsupportedPayload("expected a JSON object or array")),
        }
    }

    /// Encodes the payload for publishing.
    ///
    /// # Errors
    ///
    /// Returns an error if a command payload is not valid JSON.
    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        let encoded = match self {
            Self::Stream(message) => serde_json::to_vec(message)?,
            Self::Batch(messages) => serde_json::to_vec(messages)?,
            Self::Command(command) => serde_json::to_vec(command)?,
        };

        Ok(encoded)
    }
}

impl From<StreamMessage> for PubSubMessage {
    fn from(message: StreamMessage) -> Self {
        Self::Stream(message)
    }
}

impl From<RemoteCommandMessage> for PubSubMessage {
    fn from(command: RemoteCommandMessage) -> Self {
        Self::Command(command)
    }
}
