use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use relay_common::{RemoteCommandMessage, StreamMessage};
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;

use crate::{BroadcastHandler, Subscriber};

const RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);

/// Handler recording everything it is given.
#[derive(Clone, Debug)]
pub struct TestHandler {
    messages: mpsc::Sender<StreamMessage>,
    commands: mpsc::Sender<RemoteCommandMessage>,
    received_messages: Arc<Mutex<mpsc::Receiver<StreamMessage>>>,
    received_commands: Arc<Mutex<mpsc::Receiver<RemoteCommandMessage>>>,
}

impl Default for TestHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHandler {
    /// Creates an empty handler.
    #[must_use]
    pub fn new() -> Self {
        let (messages, received_messages) = mpsc::channel(16);
        let (commands, received_commands) = mpsc::channel(16);

        Self {
            messages,
            commands,
            received_messages: Arc::new(Mutex::new(received_messages)),
            received_commands: Arc::new(Mutex::new(received_commands)),
        }
    }

    /// Next delivered message, or `None` if nothing arrives in time.
    pub async fn receive(&self) -> Option<StreamMessage> {
        let mut receiver = self.received_messages.lock().await;
        timeout(RECEIVE_TIMEOUT, receiver.recv()).await.ok().flatten()
    }

    /// Next delivered command, or `None` if nothing arrives in time.
    pub async fn receive_command(&self) -> Option<RemoteCommandMessage> {
        let mut receiver = self.received_commands.lock().await;
        timeout(RECEIVE_TIMEOUT, receiver.recv()).await.ok().flatten()
    }
}

#[async_trait]
impl BroadcastHandler for TestHandler {
    type Error = Infallible;

    async fn broadcast(&self, message: StreamMessage) -> Result<(), Self::Error> {
        let _ = self.messages.send(message).await;
        Ok(())
    }

    async fn execute_remote_command(
        &self,
        command: RemoteCommandMessage,
    ) -> Result<(), Self::Error> {
        let _ = self.commands.send(command).await;
        Ok(())
    }
}

/// Waits until a subscriber is ready to receive messages of a stream. A
/// stream prefixed with `-` waits for the subscription to be gone.
pub type SubscriptionWaiter<S> =
    Box<dyn for<'a> Fn(&'a S, &'a str) -> BoxFuture<'a, ()> + Send + Sync>;

/// Runs the shared subscriber checks.
///
/// Single-node subscribers must loop broadcasts and commands back to their
/// own handler. Multi-node subscribers are additionally checked with a
/// second instance: broadcasts reach only the instances subscribed to the
/// stream, commands reach every instance.
///
/// # Panics
///
/// Panics when the subscriber misbehaves.
pub async fn shared_subscriber_tests<S, F>(factory: F, wait: SubscriptionWaiter<S>)
where
    S: Subscriber,
    F: Fn(TestHandler) -> S,
{
    let handler = TestHandler::new();
    let subscriber = factory(handler.clone());
    let (errors, _errors_rx) = mpsc::channel(1);

    subscriber
        .start(errors.clone())
        .await
        .expect("subscriber failed to start");
    wait(&subscriber, "internal").await;

    // Broadcast
    subscriber.subscribe("test").await.expect("subscribe failed");
    wait(&subscriber, "test").await;

    subscriber
        .broadcast(&StreamMessage::new("test", "boo"))
        .await
        .expect("broadcast failed");

    let message = handler.receive().await.expect("broadcast not delivered");
    assert_eq!(message.data, "boo");

    // Broadcast commands
    subscriber
        .broadcast_command(&RemoteCommandMessage::new("test", r#"{"foo":"bar"}"#))
        .await
        .expect("broadcast_command failed");

    let command = handler.receive_command().await.expect("command not delivered");
    assert_eq!(command.command, "test");

    if !subscriber.is_multi_node() {
        subscriber.shutdown().await.expect("shutdown failed");
        return;
    }

    let other_handler = TestHandler::new();
    let other_subscriber = factory(other_handler.clone());

    other_subscriber
        .start(errors)
        .await
        .expect("second subscriber failed to start");
    wait(&other_subscriber, "internal").await;

    // Subscribe - Broadcast
    subscriber.subscribe("a").await.expect("subscribe failed");
    other_subscriber.subscribe("b").await.expect("subscribe failed");
    other_subscriber.subscribe("a").await.expect("subscribe failed");

    wait(&subscriber, "a").await;
    wait(&other_subscriber, "a").await;
    wait(&other_subscriber, "b").await;

    subscriber
        .broadcast(&StreamMessage::new("a", "1"))
        .await
        .expect("broadcast failed");

    let message = handler.receive().await.expect("broadcast not delivered");
    assert_eq!((message.stream.as_str(), message.data.as_str()), ("a", "1"));
    assert!(handler.receive().await.is_none(), "must broadcast message once");

    let message = other_handler.receive().await.expect("broadcast not delivered");
    assert_eq!((message.stream.as_str(), message.data.as_str()), ("a", "1"));
    assert!(other_handler.receive().await.is_none(), "must broadcast message once");

    subscriber
        .broadcast(&StreamMessage::new("b", "2"))
        .await
        .expect("broadcast failed");

    assert!(
        handler.receive().await.is_none(),
        "should not broadcast message for unknown stream"
    );

    let message = other_handler.receive().await.expect("broadcast not delivered");
    assert_eq!((message.stream.as_str(), message.data.as_str()), ("b", "2"));

    // Re-transmit commands
    subscriber
        .broadcast_command(&RemoteCommandMessage::new("test", ""))
        .await
        .expect("broadcast_command failed");

    assert_eq!(
        handler.receive_command().await.expect("command not delivered").command,
        "test"
    );
    assert_eq!(
        other_handler
            .receive_command()
            .await
            .expect("command not delivered")
            .command,
        "test"
    );

    // Subscribe - Broadcast - Unsubscribe - Broadcast
    subscriber
        .broadcast(&StreamMessage::new("a", "1"))
        .await
        .expect("broadcast failed");

    assert_eq!(handler.receive().await.expect("broadcast not delivered").data, "1");
    assert_eq!(
        other_handler.receive().await.expect("broadcast not delivered").data,
        "1"
    );

    subscriber.unsubscribe("a").await.expect("unsubscribe failed");
    wait(&subscriber, "-a").await;

    subscriber
        .broadcast(&StreamMessage::new("a", "2"))
        .await
        .expect("broadcast failed");

    assert!(
        handler.receive().await.is_none(),
        "should not broadcast message for unsubscribed stream"
    );
    assert_eq!(
        other_handler.receive().await.expect("broadcast not delivered").data,
        "2"
    );

    other_subscriber.shutdown().await.expect("shutdown failed");
    subscriber.shutdown().await.expect("shutdown failed");
}

/// Waiter for subscribers whose subscriptions take effect immediately.
#[must_use]
pub fn no_wait<S: Subscriber>() -> SubscriptionWaiter<S> {
    Box::new(ready::<S>)
}

fn ready<'a, S>(_subscriber: &'a S, _stream: &'a str) -> BoxFuture<'a, ()> {
    Box::pin(async {})
}
