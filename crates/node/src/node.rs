use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use relay_common::{RemoteCommandMessage, RemoteDisconnectMessage, StreamMessage};
use relay_hub::{Encoder, Hub, Session};
use relay_pubsub::Subscriber;
use relay_pubsub_memory::{LegacySubscriber, MemoryBus, MemorySubscriber};
use relay_pubsub_redis::RedisSubscriber;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::interest::Interest;
use crate::{AnySubscriber, Error, HubHandler, NodeConfig, PubSubAdapter};

/// Capacity of the channel reporting subscriber failures.
const FAILURES_CAPACITY: usize = 4;

/// A relay server instance: the local hub plus the pub/sub backend linking
/// it to other instances.
///
/// Broadcasts are published through the backend, which delivers them to the
/// hubs of every interested instance, this one included.
pub struct Node<S, E> {
    hub: Hub<S, E>,
    subscriber: AnySubscriber<HubHandler<S, E>>,
    interest: Mutex<Interest>,
    started: AtomicBool,
}

impl<S: Session, E: Encoder> Node<S, E> {
    /// Creates a node. `bus` is only used by the memory adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub or backend settings are invalid.
    pub fn new(config: NodeConfig, encoder: E, bus: MemoryBus) -> Result<Self, Error> {
        let hub = Hub::new(&config.hub, encoder)?;
        let handler = HubHandler::new(hub.clone());

        let subscriber = match config.pubsub {
            PubSubAdapter::Legacy => AnySubscriber::Legacy(LegacySubscriber::new(handler)),
            PubSubAdapter::Memory => AnySubscriber::Memory(MemorySubscriber::new(handler, bus)),
            PubSubAdapter::Redis(redis) => {
                AnySubscriber::Redis(RedisSubscriber::new(&redis, handler)?)
            }
        };

        Ok(Self {
            hub,
            subscriber,
            interest: Mutex::new(Interest::default()),
            started: AtomicBool::new(false),
        })
    }

    /// The local hub.
    pub const fn hub(&self) -> &Hub<S, E> {
        &self.hub
    }

    /// The pub/sub backend.
    pub const fn subscriber(&self) -> &AnySubscriber<HubHandler<S, E>> {
        &self.subscriber
    }

    /// Starts the backend. The returned receiver yields a failure once the
    /// backend stops for good.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on a second call, or the backend's
    /// start failure.
    pub async fn start(&self) -> Result<mpsc::Receiver<Error>, Error> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }

        let (errors, failures) = mpsc::channel(FAILURES_CAPACITY);
        self.subscriber.start(errors).await?;

        info!(multi_node = self.subscriber.is_multi_node(), "node started");

        Ok(failures)
    }

    /// Registers a session with the hub.
    ///
    /// # Errors
    ///
    /// Returns an error after shutdown.
    pub async fn add_session(&self, session: Arc<S>) -> Result<(), Error> {
        self.hub.add_session(session).await?;
        Ok(())
    }

    /// Unregisters a session and drops its stream interest.
    ///
    /// # Errors
    ///
    /// Returns an error after shutdown or if the backend fails to
    /// unsubscribe.
    pub async fn remove_session(&self, session: Arc<S>) -> Result<(), Error> {
        let mut interest = self.interest.lock().await;
        let released = interest.remove_session(session.id());

        self.hub.remove_session(session).await?;
        self.release(released).await
    }

    /// Subscribes a session to `stream` under `identifier`, subscribing the
    /// backend on the first interest in `stream`. Unregistered sessions are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns an error after shutdown or if the backend fails to subscribe.
    pub async fn subscribe_session(
        &self,
        sid: &str,
        stream: &str,
        identifier: &str,
    ) -> Result<(), Error> {
        let mut interest = self.interest.lock().await;

        if !self.hub.has_session(sid).await? {
            debug!(%sid, %stream, "subscribe skipped, session not registered");
            return Ok(());
        }

        if interest.subscribe(sid, stream, identifier) {
            debug!(%stream, "first interest, subscribing backend");
            if let Err(error) = self.subscriber.subscribe(stream).await {
                interest.unsubscribe(sid, stream, identifier);
                return Err(error);
            }
        }

        self.hub.subscribe_session(sid, stream, identifier).await?;
        Ok(())
    }

    /// Removes one subscription of a session.
    ///
    /// # Errors
    ///
    /// Returns an error after shutdown or if the backend fails to
    /// unsubscribe.
    pub async fn unsubscribe_session(
        &self,
        sid: &str,
        stream: &str,
        identifier: &str,
    ) -> Result<(), Error> {
        let mut interest = self.interest.lock().await;
        let last = interest.unsubscribe(sid, stream, identifier);

        self.hub.unsubscribe_session(sid, stream, identifier).await?;

        if last {
            self.release(vec![stream.to_owned()]).await?;
        }

        Ok(())
    }

    /// Removes every subscription a session holds under `identifier`.
    ///
    /// # Errors
    ///
    /// Returns an error after shutdown or if the backend fails to
    /// unsubscribe.
    pub async fn unsubscribe_session_from_channel(
        &self,
        sid: &str,
        identifier: &str,
    ) -> Result<(), Error> {
        let mut interest = self.interest.lock().await;
        let released = interest.unsubscribe_channel(sid, identifier);

        self.hub
            .unsubscribe_session_from_channel(sid, identifier)
            .await?;
        self.release(released).await
    }

    /// Publishes a stream message to every instance.
    ///
    /// # Errors
    ///
    /// Returns the backend's publish failure.
    pub async fn broadcast(&self, message: &StreamMessage) -> Result<(), Error> {
        self.subscriber.broadcast(message).await
    }

    /// Publishes a command to every instance.
    ///
    /// # Errors
    ///
    /// Returns the backend's publish failure.
    pub async fn broadcast_command(&self, command: &RemoteCommandMessage) -> Result<(), Error> {
        self.subscriber.broadcast_command(command).await
    }

    /// Disconnects the sessions of `identity` on every instance.
    ///
    /// # Errors
    ///
    /// Returns the backend's publish failure.
    pub async fn remote_disconnect(&self, identity: &str, reconnect: bool) -> Result<(), Error> {
        let command = RemoteCommandMessage::disconnect(&RemoteDisconnectMessage {
            identifier: identity.to_owned(),
            reconnect,
        })?;

        self.broadcast_command(&command).await
    }

    /// Stops the backend, then the hub.
    pub async fn shutdown(&self) {
        if let Err(error) = self.subscriber.shutdown().await {
            warn!(%error, "failed to shut down subscriber");
        }

        self.hub.shutdown().await;

        info!("node stopped");
    }

    async fn release(&self, streams: Vec<String>) -> Result<(), Error> {
        for stream in streams {
            debug!(%stream, "no interest left, unsubscribing backend");
            self.subscriber.unsubscribe(&stream).await?;
        }

        Ok(())
    }
}
