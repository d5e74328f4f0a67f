use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use relay_common::{PubSubMessage, RemoteCommandMessage, StreamMessage};
use relay_pubsub::{BroadcastHandler, DispatchError, ErrorSink, Subscriber, dispatch_message};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{Connector, PAYLOAD_FIELD, StreamConnection, StreamEntry};
use crate::streamer::generate_consumer_name;
use crate::{
    Error, RedisConnector, RedisSubscriberConfig, StreamHandler, Streamer, StreamerState,
};

/// Slack added to the block duration before a blocked read times out.
const RESPONSE_TIMEOUT_SLACK: Duration = Duration::from_secs(1);

/// Subscriber linking server instances through Redis streams.
///
/// Published payloads are appended to the ingress stream, where the
/// instances compete for them: exactly one live instance takes each payload
/// and relays it to the fan-out stream, and payloads abandoned by a dead
/// instance are claimed by the survivors. Every instance reads the fan-out
/// stream through a group of its own, so each relayed payload reaches all of
/// them. Stream messages are delivered for subscribed streams only, commands
/// always.
pub struct RedisSubscriber<H, C: Connector = RedisConnector> {
    handler: H,
    config: RedisSubscriberConfig,
    ingress: Streamer<C>,
    fanout: Streamer<C>,
    publisher: Arc<Publisher<C>>,
    streams: Arc<RwLock<HashSet<String>>>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
}

impl<H: BroadcastHandler> RedisSubscriber<H> {
    /// Creates a subscriber connecting to the configured Redis server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an invalid URL or stream settings.
    pub fn new(config: &RedisSubscriberConfig, handler: H) -> Result<Self, Error> {
        let connector =
            RedisConnector::new(&config.redis, config.block() + RESPONSE_TIMEOUT_SLACK)?;

        Self::with_connector(config, handler, connector)
    }
}

impl<H: BroadcastHandler, C: Connector + Clone> RedisSubscriber<H, C> {
    /// Creates a subscriber on top of `connector`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for invalid stream settings.
    pub fn with_connector(
        config: &RedisSubscriberConfig,
        handler: H,
        connector: C,
    ) -> Result<Self, Error> {
        config.validate()?;

        let consumer = config
            .consumer_name
            .clone()
            .unwrap_or_else(generate_consumer_name);
        let policy = config.redis.reconnect_policy();

        let ingress = Streamer::new(config.ingress(&consumer), policy, connector.clone())?;
        let fanout = Streamer::new(config.fanout(&consumer), policy, connector.clone())?;

        Ok(Self {
            handler,
            config: config.clone(),
            ingress,
            fanout,
            publisher: Arc::new(Publisher::new(connector)),
            streams: Arc::new(RwLock::new(HashSet::new())),
            monitors: Mutex::new(Vec::new()),
        })
    }

    /// Name of this instance within the groups.
    pub fn consumer(&self) -> &str {
        self.ingress.consumer()
    }

    /// The streamer competing for published payloads.
    pub const fn ingress(&self) -> &Streamer<C> {
        &self.ingress
    }

    /// The streamer reading this instance's view of the fan-out stream.
    pub const fn fanout(&self) -> &Streamer<C> {
        &self.fanout
    }

    async fn publish(&self, message: PubSubMessage) -> Result<(), Error> {
        let encoded = message.to_json()?;
        let payload = std::str::from_utf8(&encoded).map_err(relay_common::Error::from)?;

        let id = self
            .publisher
            .add(&self.config.stream, payload, None)
            .await?;

        debug!(stream = %self.config.stream, %id, "payload published");

        Ok(())
    }

    async fn stop(&self) {
        self.ingress.shutdown().await;
        self.fanout.shutdown().await;
        self.publisher.close().await;
    }
}

/// Forwards a terminal failure of one streamer to `errors`.
fn monitor(
    mut changes: watch::Receiver<StreamerState>,
    errors: ErrorSink<Error>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = match changes.wait_for(StreamerState::is_terminal).await {
            Ok(state) => state.outcome(),
            Err(_) => Ok(()),
        };

        if let Err(error) = outcome {
            let _ = errors.send(error).await;
        }
    })
}

#[async_trait]
impl<H: BroadcastHandler, C: Connector + Clone> Subscriber for RedisSubscriber<H, C> {
    type Error = Error;

    async fn start(&self, errors: ErrorSink<Self::Error>) -> Result<(), Self::Error> {
        self.fanout
            .start(FanoutHandler {
                handler: self.handler.clone(),
                streams: self.streams.clone(),
            })
            .await?;

        self.ingress
            .start(RelayHandler {
                publisher: self.publisher.clone(),
                stream: self.config.fanout_stream(),
                max_len: self.config.fanout_max_len,
            })
            .await?;

        let mut monitors = self.monitors.lock().await;
        for streamer in [&self.ingress, &self.fanout] {
            monitors.push(monitor(streamer.state_changes(), errors.clone()));
        }

        info!(consumer = %self.consumer(), "redis subscriber started");

        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        let limit = self.config.shutdown_timeout();
        let stopped = tokio::time::timeout(limit, self.stop()).await;

        for monitor in self.monitors.lock().await.drain(..) {
            monitor.abort();
        }

        if stopped.is_err() {
            warn!(?limit, "redis subscriber did not stop in time");
            return Err(Error::ShutdownTimeout(limit));
        }

        info!(consumer = %self.consumer(), "redis subscriber stopped");

        Ok(())
    }

    async fn subscribe(&self, stream: &str) -> Result<(), Self::Error> {
        if self.streams.write().insert(stream.to_owned()) {
            debug!(%stream, "subscribed");
        }

        Ok(())
    }

    async fn unsubscribe(&self, stream: &str) -> Result<(), Self::Error> {
        if self.streams.write().remove(stream) {
            debug!(%stream, "unsubscribed");
        }

        Ok(())
    }

    async fn broadcast(&self, message: &StreamMessage) -> Result<(), Self::Error> {
        self.publish(PubSubMessage::Stream(message.clone())).await
    }

    async fn broadcast_command(&self, command: &RemoteCommandMessage) -> Result<(), Self::Error> {
        self.publish(PubSubMessage::Command(command.clone())).await
    }

    fn is_multi_node(&self) -> bool {
        true
    }
}

/// Appends payloads over one lazily opened connection.
struct Publisher<C: Connector> {
    connector: C,
    connection: Mutex<Option<C::Connection>>,
}

impl<C: Connector> Publisher<C> {
    fn new(connector: C) -> Self {
        Self {
            connector,
            connection: Mutex::new(None),
        }
    }

    async fn add(
        &self,
        stream: &str,
        payload: &str,
        max_len: Option<usize>,
    ) -> Result<String, Error> {
        let mut slot = self.connection.lock().await;
        let mut connection = match slot.take() {
            Some(connection) => connection,
            None => self.connector.connect().await?,
        };

        // A failed connection is dropped and replaced on the next call.
        let id = connection
            .add(stream, &[(PAYLOAD_FIELD, payload)], max_len)
            .await?;
        *slot = Some(connection);

        Ok(id)
    }

    async fn close(&self) {
        self.connection.lock().await.take();
    }
}

/// Moves payloads taken from the ingress stream to the fan-out stream.
struct RelayHandler<C: Connector> {
    publisher: Arc<Publisher<C>>,
    stream: String,
    max_len: usize,
}

#[async_trait]
impl<C: Connector> StreamHandler for RelayHandler<C> {
    type Error = Error;

    async fn handle(&self, entry: &StreamEntry) -> Result<(), Self::Error> {
        let Some(payload) = entry.payload() else {
            warn!(id = %entry.id, "entry has no payload, dropping");
            return Ok(());
        };

        if let Err(error) = PubSubMessage::from_json(payload.as_bytes()) {
            warn!(id = %entry.id, %error, "malformed payload, dropping");
            return Ok(());
        }

        let id = self
            .publisher
            .add(&self.stream, payload, Some(self.max_len))
            .await?;

        debug!(from = %entry.id, to = %id, "payload relayed");

        Ok(())
    }
}

/// Decodes fan-out entries and hands them to a [`BroadcastHandler`].
struct FanoutHandler<H> {
    handler: H,
    streams: Arc<RwLock<HashSet<String>>>,
}

impl<H> FanoutHandler<H> {
    /// Drops stream messages nobody here subscribed to.
    fn wanted(&self, message: PubSubMessage) -> Option<PubSubMessage> {
        let streams = self.streams.read();

        match message {
            PubSubMessage::Stream(message) => streams
                .contains(&message.stream)
                .then_some(PubSubMessage::Stream(message)),
            PubSubMessage::Batch(mut messages) => {
                messages.retain(|message| streams.contains(&message.stream));
                (!messages.is_empty()).then_some(PubSubMessage::Batch(messages))
            }
            command @ PubSubMessage::Command(_) => Some(command),
        }
    }
}

#[async_trait]
impl<H: BroadcastHandler> StreamHandler for FanoutHandler<H> {
    type Error = Error;

    async fn handle(&self, entry: &StreamEntry) -> Result<(), Self::Error> {
        let Some(payload) = entry.payload() else {
            warn!(id = %entry.id, "entry has no payload, dropping");
            return Ok(());
        };

        let message = match PubSubMessage::from_json(payload.as_bytes()) {
            Ok(message) => message,
            Err(error) => {
                warn!(id = %entry.id, %error, "malformed payload, dropping");
                return Ok(());
            }
        };

        let Some(message) = self.wanted(message) else {
            return Ok(());
        };

        match dispatch_message(&self.handler, message).await {
            Ok(()) => Ok(()),
            Err(DispatchError::Decode(error)) => {
                warn!(id = %entry.id, %error, "malformed payload, dropping");
                Ok(())
            }
            Err(DispatchError::Handler(error)) => Err(Error::Handler(error.to_string())),
        }
    }
}
