use async_trait::async_trait;
use relay_common::{RemoteCommandMessage, StreamMessage};
use relay_pubsub::{BroadcastHandler, ErrorSink, Subscriber};
use relay_pubsub_memory::{LegacySubscriber, MemorySubscriber};
use relay_pubsub_redis::RedisSubscriber;
use tokio::sync::mpsc;

use crate::Error;

/// The pub/sub backend selected by configuration.
pub enum AnySubscriber<H> {
    /// Single node loopback.
    Legacy(LegacySubscriber<H>),

    /// In-process bus.
    Memory(MemorySubscriber<H>),

    /// Redis stream shared by all nodes.
    Redis(RedisSubscriber<H>),
}

/// Converts failures of a backend into node errors.
fn forward<E>(errors: ErrorSink<Error>) -> ErrorSink<E>
where
    E: Into<Error> + Send + 'static,
{
    let (sender, mut receiver) = mpsc::channel::<E>(1);

    tokio::spawn(async move {
        while let Some(error) = receiver.recv().await {
            if errors.send(error.into()).await.is_err() {
                break;
            }
        }
    });

    sender
}

#[async_trait]
impl<H: BroadcastHandler> Subscriber for AnySubscriber<H> {
    type Error = Error;

    async fn start(&self, errors: ErrorSink<Self::Error>) -> Result<(), Self::Error> {
        match self {
            Self::Legacy(subscriber) => subscriber.start(forward(errors)).await?,
            Self::Memory(subscriber) => subscriber.start(forward(errors)).await?,
            Self::Redis(subscriber) => subscriber.start(forward(errors)).await?,
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        match self {
            Self::Legacy(subscriber) => subscriber.shutdown().await?,
            Self::Memory(subscriber) => subscriber.shutdown().await?,
            Self::Redis(subscriber) => subscriber.shutdown().await?,
        }
        Ok(())
    }

    async fn subscribe(&self, stream: &str) -> Result<(), Self::Error> {
        match self {
            Self::Legacy(subscriber) => subscriber.subscribe(stream).await?,
            Self::Memory(subscriber) => subscriber.subscribe(stream).await?,
            Self::Redis(subscriber) => subscriber.subscribe(stream).await?,
        }
        Ok(())
    }

    async fn unsubscribe(&self, stream: &str) -> Result<(), Self::Error> {
        match self {
            Self::Legacy(subscriber) => subscriber.unsubscribe(stream).await?,
            Self::Memory(subscriber) => subscriber.unsubscribe(stream).await?,
            Self::Redis(subscriber) => subscriber.unsubscribe(stream).await?,
        }
        Ok(())
    }

    async fn broadcast(&self, message: &StreamMessage) -> Result<(), Self::Error> {
        match self {
            Self::Legacy(subscriber) => subscriber.broadcast(message).await?,
            Self::Memory(subscriber) => subscriber.broadcast(message).await?,
            Self::Redis(subscriber) => subscriber.broadcast(message).await?,
        }
        Ok(())
    }

    async fn broadcast_command(&self, command: &RemoteCommandMessage) -> Result<(), Self::Error> {
        match self {
            Self::Legacy(subscriber) => subscriber.broadcast_command(command).await?,
            Self::Memory(subscriber) => subscriber.broadcast_command(command).await?,
            Self::Redis(subscriber) => subscriber.broadcast_command(command).await?,
        }
        Ok(())
    }

    fn is_multi_node(&self) -> bool {
        match self {
            Self::Legacy(subscriber) => subscriber.is_multi_node(),
            Self::Memory(subscriber) => subscriber.is_multi_node(),
            Self::Redis(subscriber) => subscriber.is_multi_node(),
        }
    }
}
