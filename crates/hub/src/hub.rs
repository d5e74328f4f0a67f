use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use relay_common::{RemoteDisconnectMessage, StreamMessage};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::gate::{Gate, GateJob, gate_for};
use crate::registry::{Registered, Registry};
use crate::{Encoder, Error, HubConfig, Session};

enum Registration<S> {
    Add(Arc<S>),
    Remove {
        session: Arc<S>,
        applied: Option<oneshot::Sender<()>>,
    },
    Lookup(Lookup<S>),
}

enum Lookup<S> {
    ByIdentity(String, oneshot::Sender<Option<Arc<S>>>),
    Contains(String, oneshot::Sender<bool>),
    Sessions(oneshot::Sender<Vec<Arc<S>>>),
    #[cfg(test)]
    Consistency(oneshot::Sender<bool>),
}

enum SubscriptionChange {
    Subscribe {
        sid: String,
        stream: String,
        identifier: String,
    },
    Unsubscribe {
        sid: String,
        stream: String,
        identifier: String,
    },
    UnsubscribeChannel {
        sid: String,
        identifier: String,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct HubStats {
    sessions: AtomicUsize,
    identities: AtomicUsize,
    streams: AtomicUsize,
}

impl HubStats {
    fn record<S: Session>(&self, registry: &Registry<S>) {
        self.sessions.store(registry.size(), Ordering::Relaxed);
        self.identities.store(registry.uniq_size(), Ordering::Relaxed);
        self.streams.store(registry.streams_size(), Ordering::Relaxed);
    }
}

/// Session registry and broadcast dispatcher.
///
/// A single actor task owns the registry and applies changes one at a time.
/// Fan-out runs on a fixed pool of gates keyed by stream, so delivery never
/// stalls registry updates and messages of one stream keep their order.
///
/// Queues are drained with priority: registrations, then subscription
/// changes, then broadcasts, then remote disconnects. Changes enqueued by one
/// caller are therefore applied before a broadcast that caller enqueues
/// afterwards.
pub struct Hub<S, E> {
    registrations: mpsc::Sender<Registration<S>>,
    subscriptions: mpsc::Sender<SubscriptionChange>,
    broadcasts: mpsc::Sender<StreamMessage>,
    disconnects: mpsc::Sender<RemoteDisconnectMessage>,
    stats: Arc<HubStats>,
    shutdown_token: CancellationToken,
    actor: Arc<Mutex<Option<JoinHandle<()>>>>,
    _encoder: PhantomData<fn() -> E>,
}

impl<S, E> Clone for Hub<S, E> {
    fn clone(&self) -> Self {
        Self {
            registrations: self.registrations.clone(),
            subscriptions: self.subscriptions.clone(),
            broadcasts: self.broadcasts.clone(),
            disconnects: self.disconnects.clone(),
            stats: self.stats.clone(),
            shutdown_token: self.shutdown_token.clone(),
            actor: self.actor.clone(),
            _encoder: PhantomData,
        }
    }
}

impl<S: Session, E: Encoder> Hub<S, E> {
    /// Starts the actor and the gate pool. Must be called within a tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when a pool or queue size is zero.
    pub fn new(config: &HubConfig, encoder: E) -> Result<Self, Error> {
        config.validate()?;

        let encoder = Arc::new(encoder);
        let gates = (0..config.pool_size)
            .map(|index| Gate::spawn(index, config.gate_queue, encoder.clone()))
            .collect();

        let (registrations, registrations_rx) = mpsc::channel(config.register_queue);
        let (subscriptions, subscriptions_rx) = mpsc::channel(config.subscribe_queue);
        let (broadcasts, broadcasts_rx) = mpsc::channel(config.broadcast_queue);
        let (disconnects, disconnects_rx) = mpsc::channel(config.disconnect_queue);

        let stats = Arc::new(HubStats::default());
        let shutdown_token = CancellationToken::new();

        let actor = HubActor {
            registry: Registry::default(),
            gates,
            stats: stats.clone(),
        };

        let handle = tokio::spawn(
            actor
                .run(
                    shutdown_token.clone(),
                    registrations_rx,
                    subscriptions_rx,
                    broadcasts_rx,
                    disconnects_rx,
                )
                .instrument(info_span!("hub")),
        );

        info!(pool_size = config.pool_size, "hub started");

        Ok(Self {
            registrations,
            subscriptions,
            broadcasts,
            disconnects,
            stats,
            shutdown_token,
            actor: Arc::new(Mutex::new(Some(handle))),
            _encoder: PhantomData,
        })
    }

    /// Registers a session.
    ///
    /// Re-adding a known id replaces the stored handle, keeps the session's
    /// subscriptions and moves it to its current identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after shutdown.
    pub async fn add_session(&self, session: Arc<S>) -> Result<(), Error> {
        self.register(Registration::Add(session)).await
    }

    /// Unregisters a session and drops all its subscriptions, returning once
    /// the removal has been applied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after shutdown.
    pub async fn remove_session(&self, session: Arc<S>) -> Result<(), Error> {
        let (applied, done) = oneshot::channel();

        self.register(Registration::Remove {
            session,
            applied: Some(applied),
        })
        .await?;

        done.await.map_err(|_| Error::Closed)
    }

    /// Enqueues the removal of a session without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after shutdown.
    pub async fn remove_session_later(&self, session: Arc<S>) -> Result<(), Error> {
        self.register(Registration::Remove {
            session,
            applied: None,
        })
        .await
    }

    /// Subscribes a registered session to `stream` under `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after shutdown.
    pub async fn subscribe_session(
        &self,
        sid: &str,
        stream: &str,
        identifier: &str,
    ) -> Result<(), Error> {
        self.change(SubscriptionChange::Subscribe {
            sid: sid.to_owned(),
            stream: stream.to_owned(),
            identifier: identifier.to_owned(),
        })
        .await
    }

    /// Removes one (stream, identifier) subscription of a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after shutdown.
    pub async fn unsubscribe_session(
        &self,
        sid: &str,
        stream: &str,
        identifier: &str,
    ) -> Result<(), Error> {
        self.change(SubscriptionChange::Unsubscribe {
            sid: sid.to_owned(),
            stream: stream.to_owned(),
            identifier: identifier.to_owned(),
        })
        .await
    }

    /// Removes every stream a session receives under `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after shutdown.
    pub async fn unsubscribe_session_from_channel(
        &self,
        sid: &str,
        identifier: &str,
    ) -> Result<(), Error> {
        self.change(SubscriptionChange::UnsubscribeChannel {
            sid: sid.to_owned(),
            identifier: identifier.to_owned(),
        })
        .await
    }

    /// Enqueues raw data for every subscriber of `stream`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after shutdown.
    pub async fn broadcast(&self, stream: &str, data: &str) -> Result<(), Error> {
        self.broadcast_message(StreamMessage::new(stream, data)).await
    }

    /// Enqueues a prepared message for every subscriber of its stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after shutdown.
    pub async fn broadcast_message(&self, message: StreamMessage) -> Result<(), Error> {
        self.ensure_running()?;
        self.broadcasts
            .send(message)
            .await
            .map_err(|_| Error::Closed)
    }

    /// Enqueues a forced disconnect of every session registered under
    /// `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after shutdown.
    pub async fn remote_disconnect(&self, identity: &str, reconnect: bool) -> Result<(), Error> {
        self.ensure_running()?;
        self.disconnects
            .send(RemoteDisconnectMessage {
                identifier: identity.to_owned(),
                reconnect,
            })
            .await
            .map_err(|_| Error::Closed)
    }

    /// Returns one live session registered under `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after shutdown.
    pub async fn find_by_identity(&self, identity: &str) -> Result<Option<Arc<S>>, Error> {
        let (reply, response) = oneshot::channel();
        self.register(Registration::Lookup(Lookup::ByIdentity(
            identity.to_owned(),
            reply,
        )))
        .await?;

        response.await.map_err(|_| Error::Closed)
    }

    /// Whether a session with id `sid` is registered, once every
    /// registration enqueued before this call has been applied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after shutdown.
    pub async fn has_session(&self, sid: &str) -> Result<bool, Error> {
        let (reply, response) = oneshot::channel();
        self.register(Registration::Lookup(Lookup::Contains(sid.to_owned(), reply)))
            .await?;

        response.await.map_err(|_| Error::Closed)
    }

    /// Returns every registered session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after shutdown.
    pub async fn sessions(&self) -> Result<Vec<Arc<S>>, Error> {
        let (reply, response) = oneshot::channel();
        self.register(Registration::Lookup(Lookup::Sessions(reply)))
            .await?;

        response.await.map_err(|_| Error::Closed)
    }

    /// Waits until every registration and subscription change enqueued
    /// before this call has been applied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after shutdown.
    pub async fn flush(&self) -> Result<(), Error> {
        let (reply, response) = oneshot::channel();
        self.change(SubscriptionChange::Flush(reply)).await?;

        response.await.map_err(|_| Error::Closed)
    }

    /// Number of registered sessions.
    pub fn size(&self) -> usize {
        self.stats.sessions.load(Ordering::Relaxed)
    }

    /// Number of distinct identities.
    pub fn uniq_size(&self) -> usize {
        self.stats.identities.load(Ordering::Relaxed)
    }

    /// Number of streams with at least one subscriber.
    pub fn streams_size(&self) -> usize {
        self.stats.streams.load(Ordering::Relaxed)
    }

    /// Stops the actor and waits for it to exit. Work already handed to the
    /// gates is delivered before this returns.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();

        if let Some(handle) = self.actor.lock().await.take() {
            if let Err(e) = handle.await {
                error!("hub actor failed: {e}");
            }

            info!("hub stopped");
        }
    }

    #[cfg(test)]
    async fn is_consistent(&self) -> Result<bool, Error> {
        let (reply, response) = oneshot::channel();
        self.register(Registration::Lookup(Lookup::Consistency(reply)))
            .await?;

        response.await.map_err(|_| Error::Closed)
    }

    fn ensure_running(&self) -> Result<(), Error> {
        if self.shutdown_token.is_cancelled() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    async fn register(&self, registration: Registration<S>) -> Result<(), Error> {
        self.ensure_running()?;
        self.registrations
            .send(registration)
            .await
            .map_err(|_| Error::Closed)
    }

    async fn change(&self, change: SubscriptionChange) -> Result<(), Error> {
        self.ensure_running()?;
        self.subscriptions
            .send(change)
            .await
            .map_err(|_| Error::Closed)
    }
}

struct HubActor<S> {
    registry: Registry<S>,
    gates: Vec<Gate<S>>,
    stats: Arc<HubStats>,
}

impl<S: Session> HubActor<S> {
    async fn run(
        mut self,
        shutdown_token: CancellationToken,
        mut registrations: mpsc::Receiver<Registration<S>>,
        mut subscriptions: mpsc::Receiver<SubscriptionChange>,
        mut broadcasts: mpsc::Receiver<StreamMessage>,
        mut disconnects: mpsc::Receiver<RemoteDisconnectMessage>,
    ) {
        loop {
            tokio::select! {
                biased;
                () = shutdown_token.cancelled() => break,
                Some(registration) = registrations.recv() => self.register(registration),
                Some(change) = subscriptions.recv() => self.change(change),
                Some(message) = broadcasts.recv() => self.broadcast(message).await,
                Some(command) = disconnects.recv() => self.disconnect(command).await,
                else => break,
            }
        }

        self.stop().await;
    }

    fn register(&mut self, registration: Registration<S>) {
        let applied = match registration {
            Registration::Add(session) => {
                let sid = session.id().to_owned();
                let identity = session.identity().to_owned();

                match self.registry.add(session) {
                    Registered::New => debug!(%sid, %identity, "registered"),
                    Registered::Replaced => {
                        info!(%sid, %identity, "session re-registered, handle replaced");
                    }
                }

                None
            }
            Registration::Remove { session, applied } => {
                let sid = session.id();

                if self.registry.remove(sid).is_some() {
                    debug!(%sid, "unregistered");
                } else {
                    warn!(%sid, "session hasn't been registered");
                }

                applied
            }
            Registration::Lookup(lookup) => {
                self.lookup(lookup);
                return;
            }
        };

        // Counters must reflect the removal before the caller is released.
        self.stats.record(&self.registry);

        if let Some(applied) = applied {
            let _ = applied.send(());
        }
    }

    fn lookup(&self, lookup: Lookup<S>) {
        match lookup {
            Lookup::ByIdentity(identity, reply) => {
                let _ = reply.send(self.registry.find_by_identity(&identity));
            }
            Lookup::Sessions(reply) => {
                let _ = reply.send(self.registry.sessions());
            }
            Lookup::Contains(sid, reply) => {
                let _ = reply.send(self.registry.contains(&sid));
            }
            #[cfg(test)]
            Lookup::Consistency(reply) => {
                let _ = reply.send(self.registry.is_consistent());
            }
        }
    }

    fn change(&mut self, change: SubscriptionChange) {
        match change {
            SubscriptionChange::Subscribe {
                sid,
                stream,
                identifier,
            } => {
                if self.registry.subscribe(&sid, &stream, &identifier) {
                    debug!(%sid, channel = %identifier, %stream, "subscribed");
                } else {
                    debug!(%sid, channel = %identifier, %stream, "subscribe skipped, session not found");
                }
            }
            SubscriptionChange::Unsubscribe {
                sid,
                stream,
                identifier,
            } => {
                if self.registry.unsubscribe(&sid, &stream, &identifier) {
                    debug!(%sid, channel = %identifier, %stream, "unsubscribed");
                } else {
                    debug!(%sid, channel = %identifier, %stream, "no such subscription");
                }
            }
            SubscriptionChange::UnsubscribeChannel { sid, identifier } => {
                let streams = self.registry.unsubscribe_channel(&sid, &identifier);
                debug!(%sid, channel = %identifier, streams, "unsubscribed from channel");
            }
            SubscriptionChange::Flush(reply) => {
                let _ = reply.send(());
                return;
            }
        }

        self.stats.record(&self.registry);
    }

    async fn broadcast(&self, message: StreamMessage) {
        let recipients = self.registry.recipients(&message);

        if recipients.is_empty() {
            debug!(stream = %message.stream, "no sessions");
            return;
        }

        let gate = &self.gates[gate_for(&message.stream, self.gates.len())];

        if gate
            .sender
            .send(GateJob::Broadcast {
                message,
                recipients,
            })
            .await
            .is_err()
        {
            warn!("gate is gone, broadcast dropped");
        }
    }

    async fn disconnect(&self, command: RemoteDisconnectMessage) {
        let RemoteDisconnectMessage {
            identifier: identity,
            reconnect,
        } = command;

        let sessions = self.registry.identity_sessions(&identity);

        if sessions.is_empty() {
            debug!(%identity, "cannot disconnect sessions, identity not found");
            return;
        }

        let gate = &self.gates[gate_for(&identity, self.gates.len())];

        if gate
            .sender
            .send(GateJob::Disconnect {
                identity,
                sessions,
                reconnect,
            })
            .await
            .is_err()
        {
            warn!("gate is gone, remote disconnect dropped");
        }
    }

    async fn stop(self) {
        let (senders, handles): (Vec<_>, Vec<_>) = self
            .gates
            .into_iter()
            .map(|gate| (gate.sender, gate.handle))
            .unzip();

        drop(senders);

        for handle in handles {
            if let Err(e) = handle.await {
                error!("gate failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use bytes::Bytes;
    use relay_common::DisconnectMessage;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
    use tokio::time::timeout;
    use tracing_test::traced_test;

    use crate::JsonEncoder;

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Message(String),
        Disconnect { message: String, reason: String },
    }

    struct TestSession {
        id: String,
        identity: String,
        events: UnboundedSender<Event>,
    }

    impl Session for TestSession {
        fn id(&self) -> &str {
            &self.id
        }

        fn identity(&self) -> &str {
            &self.identity
        }

        fn send(&self, message: Bytes) {
            let _ = self
                .events
                .send(Event::Message(String::from_utf8_lossy(&message).into_owned()));
        }

        fn disconnect_with_message(&self, message: Bytes, reason: &str) {
            let _ = self.events.send(Event::Disconnect {
                message: String::from_utf8_lossy(&message).into_owned(),
                reason: reason.to_string(),
            });
        }
    }

    fn session(id: &str, identity: &str) -> (Arc<TestSession>, UnboundedReceiver<Event>) {
        let (events, receiver) = unbounded_channel();
        let session = Arc::new(TestSession {
            id: id.to_string(),
            identity: identity.to_string(),
            events,
        });
        (session, receiver)
    }

    async fn receive(receiver: &mut UnboundedReceiver<Event>) -> Event {
        timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("session channel closed")
    }

    /// A closed channel counts as silence: the hub dropped the session.
    async fn assert_silent(receiver: &mut UnboundedReceiver<Event>) {
        if let Ok(Some(event)) = timeout(Duration::from_millis(100), receiver.recv()).await {
            panic!("unexpected session event: {event:?}");
        }
    }

    #[derive(Clone, Default)]
    struct CountingEncoder {
        calls: Arc<AtomicUsize>,
    }

    impl Encoder for CountingEncoder {
        type Error = relay_common::Error;

        fn encode_broadcast(
            &self,
            message: &StreamMessage,
            identifier: &str,
        ) -> Result<Bytes, Self::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            JsonEncoder.encode_broadcast(message, identifier)
        }

        fn encode_disconnect(&self, message: &DisconnectMessage) -> Result<Bytes, Self::Error> {
            JsonEncoder.encode_disconnect(message)
        }
    }

    fn hub() -> Hub<TestSession, JsonEncoder> {
        Hub::new(&HubConfig::default(), JsonEncoder).unwrap()
    }

    fn counting_hub() -> (Hub<TestSession, CountingEncoder>, Arc<AtomicUsize>) {
        let encoder = CountingEncoder::default();
        let calls = encoder.calls.clone();
        (Hub::new(&HubConfig::default(), encoder).unwrap(), calls)
    }

    #[tokio::test]
    #[traced_test]
    async fn test_broadcast_to_single_identifier() {
        let hub = hub();
        let (s, mut events) = session("123", "user-1");

        hub.add_session(s).await.unwrap();
        hub.subscribe_session("123", "room:1", "chat").await.unwrap();
        hub.broadcast("room:1", "\"hi\"").await.unwrap();

        assert_eq!(
            receive(&mut events).await,
            Event::Message(r#"{"identifier":"chat","message":"hi"}"#.to_string())
        );
        assert_silent(&mut events).await;

        hub.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_broadcast_to_several_identifiers_encodes_each_once() {
        let (hub, calls) = counting_hub();
        let (s, mut events) = session("123", "user-1");

        hub.add_session(s).await.unwrap();
        hub.subscribe_session("123", "room:1", "chat").await.unwrap();
        hub.subscribe_session("123", "room:1", "chat2").await.unwrap();
        hub.broadcast("room:1", "\"hi\"").await.unwrap();

        let first = receive(&mut events).await;
        let second = receive(&mut events).await;

        let received: HashSet<String> = [first, second]
            .into_iter()
            .map(|event| match event {
                Event::Message(message) => message,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();

        assert_eq!(
            received,
            HashSet::from([
                r#"{"identifier":"chat","message":"hi"}"#.to_string(),
                r#"{"identifier":"chat2","message":"hi"}"#.to_string(),
            ])
        );
        assert_silent(&mut events).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_encodes_once_per_identifier_not_per_session() {
        let (hub, calls) = counting_hub();
        let mut receivers = Vec::new();

        for i in 0..15 {
            let (s, events) = session(&i.to_string(), &format!("user-{i}"));
            hub.add_session(s).await.unwrap();
            let identifier = if i < 10 { "chat" } else { "news" };
            hub.subscribe_session(&i.to_string(), "room:1", identifier)
                .await
                .unwrap();
            receivers.push(events);
        }

        hub.broadcast("room:1", r#"{"text":"hello"}"#).await.unwrap();

        for events in &mut receivers {
            assert_matches!(receive(events).await, Event::Message(_));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_skips_excluded_session() {
        let hub = hub();
        let (sender, mut sender_events) = session("1", "u1");
        let (other, mut other_events) = session("2", "u2");

        hub.add_session(sender).await.unwrap();
        hub.add_session(other).await.unwrap();
        hub.subscribe_session("1", "room", "chat").await.unwrap();
        hub.subscribe_session("2", "room", "chat").await.unwrap();

        hub.broadcast_message(StreamMessage::new("room", "\"hi\"").excluding_session("1"))
            .await
            .unwrap();

        assert_matches!(receive(&mut other_events).await, Event::Message(_));
        assert_silent(&mut sender_events).await;

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_keeps_stream_order() {
        let hub = Hub::new(
            &HubConfig {
                pool_size: 4,
                ..HubConfig::default()
            },
            JsonEncoder,
        )
        .unwrap();
        let (s, mut events) = session("1", "u1");

        hub.add_session(s).await.unwrap();
        hub.subscribe_session("1", "room", "chat").await.unwrap();

        for i in 0..100 {
            hub.broadcast("room", &i.to_string()).await.unwrap();
        }

        for i in 0..100 {
            assert_eq!(
                receive(&mut events).await,
                Event::Message(format!(r#"{{"identifier":"chat","message":{i}}}"#))
            );
        }

        hub.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_remote_disconnect_targets_identity_only() {
        let hub = hub();
        let (first, mut first_events) = session("1", "user-a");
        let (second, mut second_events) = session("2", "user-a");
        let (third, mut third_events) = session("3", "user-b");

        hub.add_session(first).await.unwrap();
        hub.add_session(second).await.unwrap();
        hub.add_session(third).await.unwrap();

        hub.remote_disconnect("user-a", false).await.unwrap();

        let expected = Event::Disconnect {
            message: r#"{"type":"disconnect","reason":"remote","reconnect":false}"#.to_string(),
            reason: "remote".to_string(),
        };

        assert_eq!(receive(&mut first_events).await, expected);
        assert_eq!(receive(&mut second_events).await, expected);
        assert_silent(&mut third_events).await;

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_disconnect_of_unknown_identity_is_noop() {
        let hub = hub();
        let (s, mut events) = session("1", "user-a");
        hub.add_session(s).await.unwrap();

        hub.remote_disconnect("user-z", true).await.unwrap();

        assert_silent(&mut events).await;
        assert_eq!(hub.size(), 1);

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_counters() {
        let hub = hub();
        let (a, _a_events) = session("1", "user-a");
        let (b, _b_events) = session("2", "user-a");
        let (c, _c_events) = session("3", "user-b");

        hub.add_session(a).await.unwrap();
        hub.add_session(b).await.unwrap();
        hub.add_session(c.clone()).await.unwrap();
        hub.subscribe_session("1", "room:1", "chat").await.unwrap();
        hub.subscribe_session("3", "room:2", "chat").await.unwrap();
        hub.flush().await.unwrap();

        assert_eq!(hub.size(), 3);
        assert_eq!(hub.uniq_size(), 2);
        assert_eq!(hub.streams_size(), 2);

        hub.remove_session(c).await.unwrap();

        assert_eq!(hub.size(), 2);
        assert_eq!(hub.uniq_size(), 1);
        assert_eq!(hub.streams_size(), 1);

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_session_drops_subscriptions() {
        let hub = hub();
        let (s, mut events) = session("1", "user-a");

        hub.add_session(s.clone()).await.unwrap();
        hub.subscribe_session("1", "room:1", "chat").await.unwrap();
        hub.subscribe_session("1", "room:2", "news").await.unwrap();
        hub.remove_session(s).await.unwrap();

        assert_eq!(hub.size(), 0);
        assert_eq!(hub.streams_size(), 0);
        assert!(hub.is_consistent().await.unwrap());

        hub.broadcast("room:1", "\"hi\"").await.unwrap();
        assert_silent(&mut events).await;

        hub.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_remove_unknown_session_is_noop() {
        let hub = hub();
        let (s, _events) = session("1", "user-a");

        hub.remove_session(s.clone()).await.unwrap();
        hub.remove_session_later(s).await.unwrap();
        hub.flush().await.unwrap();

        assert_eq!(hub.size(), 0);
        assert!(hub.is_consistent().await.unwrap());

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_session_from_channel() {
        let hub = hub();
        let (s, mut events) = session("1", "user-a");

        hub.add_session(s).await.unwrap();
        hub.subscribe_session("1", "room:1", "chat").await.unwrap();
        hub.subscribe_session("1", "room:2", "chat").await.unwrap();
        hub.subscribe_session("1", "room:1", "news").await.unwrap();
        hub.unsubscribe_session_from_channel("1", "chat").await.unwrap();
        hub.flush().await.unwrap();

        assert_eq!(hub.streams_size(), 1);

        hub.broadcast("room:2", "\"x\"").await.unwrap();
        hub.broadcast("room:1", "\"y\"").await.unwrap();

        assert_eq!(
            receive(&mut events).await,
            Event::Message(r#"{"identifier":"news","message":"y"}"#.to_string())
        );
        assert_silent(&mut events).await;

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_session() {
        let hub = hub();
        let (s, mut events) = session("1", "user-a");

        hub.add_session(s).await.unwrap();
        hub.subscribe_session("1", "room:1", "chat").await.unwrap();
        hub.unsubscribe_session("1", "room:1", "chat").await.unwrap();
        hub.unsubscribe_session("1", "room:1", "chat").await.unwrap();
        hub.flush().await.unwrap();

        assert_eq!(hub.streams_size(), 0);
        assert!(hub.is_consistent().await.unwrap());

        hub.broadcast("room:1", "\"x\"").await.unwrap();
        assert_silent(&mut events).await;

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_subscribe_unknown_session_is_noop() {
        let hub = hub();

        hub.subscribe_session("ghost", "room:1", "chat").await.unwrap();
        hub.flush().await.unwrap();

        assert_eq!(hub.streams_size(), 0);
        assert!(hub.is_consistent().await.unwrap());

        hub.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_re_adding_session_replaces_handle_and_keeps_subscriptions() {
        let hub = hub();
        let (old, mut old_events) = session("1", "user-a");
        let (new, mut new_events) = session("1", "user-b");

        hub.add_session(old).await.unwrap();
        hub.subscribe_session("1", "room:1", "chat").await.unwrap();
        hub.add_session(new).await.unwrap();
        hub.flush().await.unwrap();

        assert_eq!(hub.size(), 1);
        assert_eq!(hub.uniq_size(), 1);
        assert!(hub.find_by_identity("user-a").await.unwrap().is_none());
        assert_eq!(
            hub.find_by_identity("user-b").await.unwrap().unwrap().id(),
            "1"
        );

        hub.broadcast("room:1", "\"hi\"").await.unwrap();

        assert_matches!(receive(&mut new_events).await, Event::Message(_));
        assert_silent(&mut old_events).await;

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_sessions_lookup() {
        let hub = hub();
        let (a, _a_events) = session("1", "user-a");
        let (b, _b_events) = session("2", "user-b");

        hub.add_session(a).await.unwrap();
        hub.add_session(b).await.unwrap();

        let mut ids: Vec<String> = hub
            .sessions()
            .await
            .unwrap()
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        ids.sort();

        assert_eq!(ids, ["1", "2"]);

        hub.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_removal_during_broadcast() {
        let hub = Hub::new(
            &HubConfig {
                pool_size: 2,
                ..HubConfig::default()
            },
            JsonEncoder,
        )
        .unwrap();

        let mut tasks = Vec::new();

        for worker in 0..8 {
            let hub = hub.clone();
            tasks.push(tokio::spawn(async move {
                let mut receivers = Vec::new();

                for i in 0..25 {
                    let sid = format!("{worker}-{i}");
                    let (s, events) = session(&sid, &format!("user-{}", i % 3));

                    hub.add_session(s.clone()).await.unwrap();
                    hub.subscribe_session(&sid, "room", "chat").await.unwrap();
                    hub.subscribe_session(&sid, &format!("room-{i}"), "news")
                        .await
                        .unwrap();
                    hub.broadcast("room", "\"x\"").await.unwrap();

                    if i % 2 == 0 {
                        hub.remove_session(s).await.unwrap();
                    } else {
                        hub.remove_session_later(s).await.unwrap();
                    }

                    hub.broadcast(&format!("room-{i}"), "\"y\"").await.unwrap();
                    receivers.push(events);
                }

                receivers
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        hub.flush().await.unwrap();

        assert_eq!(hub.size(), 0);
        assert_eq!(hub.uniq_size(), 0);
        assert_eq!(hub.streams_size(), 0);
        assert!(hub.is_consistent().await.unwrap());

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let hub = hub();
        let (s, _events) = session("1", "user-a");

        hub.shutdown().await;
        hub.shutdown().await;

        assert_matches!(hub.add_session(s).await, Err(Error::Closed));
        assert_matches!(hub.broadcast("room", "\"x\"").await, Err(Error::Closed));
        assert_matches!(hub.remote_disconnect("user-a", false).await, Err(Error::Closed));
        assert_matches!(hub.flush().await, Err(Error::Closed));
    }

    #[tokio::test]
    async fn test_zero_pool_size_is_rejected() {
        let result = Hub::<TestSession, JsonEncoder>::new(
            &HubConfig {
                pool_size: 0,
                ..HubConfig::default()
            },
            JsonEncoder,
        );

        assert_matches!(result.err(), Some(Error::InvalidConfig(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_counters_settle_before_remove_session_returns() {
        let hub = hub();

        for i in 0..500 {
            let (s, _events) = session(&i.to_string(), "user-a");

            hub.add_session(s.clone()).await.unwrap();
            hub.remove_session(s).await.unwrap();

            assert_eq!(hub.size(), 0, "stale size after removing session {i}");
            assert_eq!(hub.uniq_size(), 0);
        }

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_has_session() {
        let hub = hub();
        let (s, _events) = session("1", "user-a");

        hub.add_session(s.clone()).await.unwrap();
        assert!(hub.has_session("1").await.unwrap());
        assert!(!hub.has_session("2").await.unwrap());

        hub.remove_session_later(s).await.unwrap();
        assert!(!hub.has_session("1").await.unwrap());

        hub.shutdown().await;
    }
}
