use bytes::Bytes;

/// A client connection as seen by the hub.
///
/// Sessions are owned by the transport layer. The hub only keeps references
/// and never waits on session I/O, so `send` must not block.
pub trait Session: Send + Sync + 'static {
    /// Unique id of the connection.
    fn id(&self) -> &str;

    /// Identity string, possibly shared by several connections of one user.
    fn identity(&self) -> &str;

    /// Queues an encoded message for delivery.
    fn send(&self, message: Bytes);

    /// Sends a final message and closes the connection.
    fn disconnect_with_message(&self, message: Bytes, reason: &str);
}
