use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use relay_common::{RemoteCommandMessage, StreamMessage};
use tokio::sync::{Mutex, broadcast};

const DEFAULT_CAPACITY: usize = 100;

static GLOBAL_BUS: LazyLock<MemoryBus> = LazyLock::new(MemoryBus::default);

/// An in-process pub/sub server.
///
/// Every stream is a broadcast channel; slow receivers lose the oldest
/// messages, which matches the at-most-once delivery of real pub/sub.
#[derive(Clone, Debug)]
pub struct MemoryBus {
    streams: Arc<Mutex<HashMap<String, broadcast::Sender<StreamMessage>>>>,
    commands: broadcast::Sender<RemoteCommandMessage>,
    capacity: usize,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MemoryBus {
    /// Creates a bus buffering up to `capacity` messages per stream.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            commands: broadcast::channel(capacity).0,
            capacity,
        }
    }

    /// The process-wide bus.
    #[must_use]
    pub fn global() -> Self {
        GLOBAL_BUS.clone()
    }

    /// Number of streams with a live channel.
    pub async fn active_streams(&self) -> usize {
        self.streams.lock().await.len()
    }

    /// Attaches a new receiver to `stream`, opening its channel if needed.
    pub(crate) async fn listen(&self, stream: &str) -> broadcast::Receiver<StreamMessage> {
        self.streams
            .lock()
            .await
            .entry(stream.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Sends `message` to the receivers of its stream. Returns `false` when
    /// nobody listens.
    pub(crate) async fn publish(&self, message: StreamMessage) -> bool {
        let streams = self.streams.lock().await;

        streams
            .get(&message.stream)
            .is_some_and(|sender| sender.send(message).is_ok())
    }

    /// Closes the channel of `stream` once its last receiver is gone.
    pub(crate) async fn release(&self, stream: &str) {
        let mut streams = self.streams.lock().await;

        if streams
            .get(stream)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            streams.remove(stream);
        }
    }

    pub(crate) fn commands(&self) -> &broadcast::Sender<RemoteCommandMessage> {
        &self.commands
    }
}
