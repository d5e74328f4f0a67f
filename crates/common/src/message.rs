use bytes::Bytes;
use serde::de::Deserializer;
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::Error;

/// Command name used to force-disconnect every session of an identity.
pub const DISCONNECT_COMMAND: &str = "disconnect";

/// A message published to a stream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    /// Stream the message belongs to.
    pub stream: String,

    /// Raw message data, usually a JSON document.
    pub data: String,

    /// Position of the message within the current epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,

    /// Incarnation of the underlying log the offset refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<String>,

    /// Delivery hints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<StreamMessageMetadata>,
}

impl StreamMessage {
    /// Creates a message without position or metadata.
    pub fn new(stream: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            data: data.into(),
            ..Self::default()
        }
    }

    /// Attaches a replay position to the message.
    #[must_use]
    pub fn with_position(mut self, offset: u64, epoch: impl Into<String>) -> Self {
        self.offset = Some(offset);
        self.epoch = Some(epoch.into());
        self
    }

    /// Skips delivery to the session with the given id.
    #[must_use]
    pub fn excluding_session(mut self, session_id: impl Into<String>) -> Self {
        self.meta = Some(StreamMessageMetadata {
            exclude_socket: Some(session_id.into()),
        });
        self
    }

    /// Session id that must not receive this message, if any.
    #[must_use]
    pub fn excluded_session(&self) -> Option<&str> {
        self.meta
            .as_ref()
            .and_then(|meta| meta.exclude_socket.as_deref())
    }
}

/// Delivery hints carried along with a stream message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessageMetadata {
    /// Id of the session that published the message (it gets no echo).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_socket: Option<String>,
}

/// A cluster-wide control message.
///
/// The payload holds raw JSON text and is embedded verbatim when the command
/// is serialized.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteCommandMessage {
    /// Command name, e.g. [`DISCONNECT_COMMAND`].
    pub command: String,

    /// Raw JSON payload. Empty means no payload.
    pub payload: Bytes,
}

impl RemoteCommandMessage {
    /// Creates a command with a raw JSON payload.
    pub fn new(command: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            payload: payload.into(),
        }
    }

    /// Builds a `disconnect` command.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn disconnect(message: &RemoteDisconnectMessage) -> Result<Self, Error> {
        Ok(Self::new(DISCONNECT_COMMAND, serde_json::to_vec(message)?))
    }

    /// Decodes the payload of a `disconnect` command.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a disconnect message.
    pub fn to_remote_disconnect(&self) -> Result<RemoteDisconnectMessage, Error> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    fn raw_payload(&self) -> Result<Option<Box<RawValue>>, Error> {
        if self.payload.is_empty() {
            return Ok(None);
        }

        let text = std::str::from_utf8(&self.payload)?;
        Ok(Some(RawValue::from_string(text.to_owned())?))
    }
}

impl Serialize for RemoteCommandMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let payload = self.raw_payload().map_err(serde::ser::Error::custom)?;

        let mut state = serializer.serialize_struct("RemoteCommandMessage", 2)?;
        state.serialize_field("command", &self.command)?;
        state.serialize_field("payload", &payload)?;
        state.end()
    }
}

#[derive(Deserialize)]
struct RemoteCommandWire {
    command: String,
    #[serde(default)]
    payload: Option<Box<RawValue>>,
}

impl<'de> Deserialize<'de> for RemoteCommandMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = RemoteCommandWire::deserialize(deserializer)?;

        Ok(Self {
            command: wire.command,
            payload: wire
                .payload
                .map(|raw| Bytes::from(raw.get().to_owned()))
                .unwrap_or_default(),
        })
    }
}

/// Payload of the `disconnect` remote command.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDisconnectMessage {
    /// Identity whose sessions must be disconnected.
    pub identifier: String,

    /// Whether clients are allowed to reconnect.
    #[serde(default)]
    pub reconnect: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_message_omits_absent_position() {
        let json = serde_json::to_string(&StreamMessage::new("room:1", "\"hi\"")).unwrap();

        assert_eq!(json, r#"{"stream":"room:1","data":"\"hi\""}"#);
    }

    #[test]
    fn stream_message_reads_exclude_socket() {
        let msg: StreamMessage = serde_json::from_str(
            r#"{"stream":"s","data":"d","meta":{"exclude_socket":"42"}}"#,
        )
        .unwrap();

        assert_eq!(msg.excluded_session(), Some("42"));
        assert_eq!(msg, StreamMessage::new("s", "d").excluding_session("42"));
    }

    #[test]
    fn command_payload_is_embedded_verbatim() {
        let cmd = RemoteCommandMessage::new("test", r#"{"foo":"bar"}"#);

        assert_eq!(
            serde_json::to_string(&cmd).unwrap(),
            r#"{"command":"test","payload":{"foo":"bar"}}"#
        );
    }

    #[test]
    fn command_without_payload() {
        let cmd: RemoteCommandMessage = serde_json::from_str(r#"{"command":"test"}"#).unwrap();

        assert!(cmd.payload.is_empty());
        assert_eq!(
            serde_json::to_string(&cmd).unwrap(),
            r#"{"command":"test","payload":null}"#
        );
    }

    #[test]
    fn disconnect_command_payload() {
        let cmd: RemoteCommandMessage = serde_json::from_str(
            r#"{"command":"disconnect","payload":{"identifier":"14","reconnect":false}}"#,
        )
        .unwrap();

        assert_eq!(cmd.command, DISCONNECT_COMMAND);
        assert_eq!(
            cmd.to_remote_disconnect().unwrap(),
            RemoteDisconnectMessage {
                identifier: "14".to_string(),
                reconnect: false,
            }
        );
    }

    #[test]
    fn invalid_command_payload_fails_to_serialize() {
        let cmd = RemoteCommandMessage::new("test", "{not json");

        assert!(serde_json::to_string(&cmd).is_err());
    }
}
