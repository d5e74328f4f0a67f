use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::{Error, StreamMessage};

/// Reason attached to disconnects triggered by a remote command.
pub const REMOTE_DISCONNECT_REASON: &str = "remote";

/// A broadcast addressed to one channel identifier of a client.
#[derive(Debug, Serialize)]
pub struct Reply {
    /// Channel identifier the message is addressed to.
    pub identifier: String,

    /// Message data. JSON data is embedded as is, anything else as a string.
    pub message: Box<RawValue>,

    /// Stream name, present for positioned messages only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,

    /// Epoch of the positioned message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epoch: Option<String>,

    /// Offset of the positioned message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl Reply {
    /// Builds the reply delivering `message` to `identifier`.
    ///
    /// # Errors
    ///
    /// Returns an error if the data cannot be embedded.
    pub fn for_identifier(message: &StreamMessage, identifier: &str) -> Result<Self, Error> {
        let body = match RawValue::from_string(message.data.clone()) {
            Ok(raw) => raw,
            Err(_) => serde_json::value::to_raw_value(&message.data)?,
        };

        let positioned = message.epoch.is_some();

        Ok(Self {
            identifier: identifier.to_owned(),
            message: body,
            stream_id: positioned.then(|| message.stream.clone()),
            epoch: message.epoch.clone(),
            offset: if positioned { message.offset } else { None },
        })
    }

    /// Serializes the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Notification sent to a client right before the server closes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "disconnect")]
pub struct DisconnectMessage {
    /// Why the session is being closed.
    pub reason: String,

    /// Whether the client may reconnect.
    pub reconnect: bool,
}

impl DisconnectMessage {
    /// Disconnect caused by a remote command.
    #[must_use]
    pub fn remote(reconnect: bool) -> Self {
        Self {
            reason: REMOTE_DISCONNECT_REASON.to_owned(),
            reconnect,
        }
    }

    /// Serializes the message.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }
}
