use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use relay_common::{RemoteCommandMessage, StreamMessage};
use relay_pubsub::{BroadcastHandler, ErrorSink, Subscriber};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{Error, MemoryBus};

/// A running stream listener.
struct Listener {
    stop: watch::Sender<()>,
    handle: JoinHandle<()>,
}

impl Listener {
    /// Stops the listener and waits until it has dropped its receiver.
    async fn stop(self, stream: &str) {
        let _ = self.stop.send(());

        if let Err(error) = self.handle.await {
            warn!(%stream, %error, "listener failed");
        }
    }
}

/// A node attached to a [`MemoryBus`].
///
/// Broadcasts reach every node subscribed to the stream, the publisher
/// included. Commands reach every started node.
pub struct MemorySubscriber<H> {
    handler: H,
    bus: MemoryBus,
    streams: Mutex<HashMap<String, Listener>>,
    commands_stop: Mutex<Option<watch::Sender<()>>>,
    stopped: AtomicBool,
}

impl<H: BroadcastHandler> MemorySubscriber<H> {
    /// Creates a node on `bus` delivering to `handler`.
    pub fn new(handler: H, bus: MemoryBus) -> Self {
        Self {
            handler,
            bus,
            streams: Mutex::new(HashMap::new()),
            commands_stop: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Streams this node currently receives.
    pub async fn subscribed_streams(&self) -> Vec<String> {
        self.streams.lock().await.keys().cloned().collect()
    }

    fn ensure_running(&self) -> Result<(), Error> {
        if self.stopped.load(Ordering::Acquire) {
            Err(Error::Shutdown)
        } else {
            Ok(())
        }
    }
}

fn spawn_listener<T, F, Fut>(
    label: String,
    mut receiver: broadcast::Receiver<T>,
    mut stop_receiver: watch::Receiver<()>,
    deliver: F,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: Fn(T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), String>> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = stop_receiver.changed() => {
                    break;
                }
                message = receiver.recv() => {
                    match message {
                        Ok(message) => {
                            if let Err(error) = deliver(message).await {
                                warn!(channel = %label, %error, "handler failed");
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(channel = %label, skipped, "receiver lagged, messages lost");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }

        debug!(channel = %label, "listener stopped");
    })
}

#[async_trait]
impl<H: BroadcastHandler> Subscriber for MemorySubscriber<H> {
    type Error = Error;

    async fn start(&self, _errors: ErrorSink<Self::Error>) -> Result<(), Self::Error> {
        self.ensure_running()?;

        let mut commands_stop = self.commands_stop.lock().await;
        if commands_stop.is_some() {
            return Ok(());
        }

        let (stop_sender, stop_receiver) = watch::channel(());
        let handler = self.handler.clone();

        // Stopped through the watch channel; the handle is not needed.
        drop(spawn_listener(
            "commands".to_owned(),
            self.bus.commands().subscribe(),
            stop_receiver,
            move |command: RemoteCommandMessage| {
                let handler = handler.clone();
                async move {
                    handler
                        .execute_remote_command(command)
                        .await
                        .map_err(|e| e.to_string())
                }
            },
        ));

        *commands_stop = Some(stop_sender);
        drop(commands_stop);

        debug!("memory subscriber started");

        Ok(())
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        self.stopped.store(true, Ordering::Release);

        if let Some(stop) = self.commands_stop.lock().await.take() {
            let _ = stop.send(());
        }

        let listeners: Vec<_> = self.streams.lock().await.drain().collect();
        for (stream, listener) in listeners {
            listener.stop(&stream).await;
            self.bus.release(&stream).await;
        }

        debug!("memory subscriber stopped");

        Ok(())
    }

    async fn subscribe(&self, stream: &str) -> Result<(), Self::Error> {
        self.ensure_running()?;

        let mut streams = self.streams.lock().await;
        if streams.contains_key(stream) {
            return Ok(());
        }

        // Attach the receiver before returning so later broadcasts are seen.
        let receiver = self.bus.listen(stream).await;
        let (stop, stop_receiver) = watch::channel(());
        let handler = self.handler.clone();

        let handle = spawn_listener(
            stream.to_owned(),
            receiver,
            stop_receiver,
            move |message: StreamMessage| {
                let handler = handler.clone();
                async move { handler.broadcast(message).await.map_err(|e| e.to_string()) }
            },
        );

        streams.insert(stream.to_owned(), Listener { stop, handle });
        drop(streams);

        debug!(%stream, "subscribed");

        Ok(())
    }

    async fn unsubscribe(&self, stream: &str) -> Result<(), Self::Error> {
        let listener = self.streams.lock().await.remove(stream);

        if let Some(listener) = listener {
            listener.stop(stream).await;
            self.bus.release(stream).await;
            debug!(%stream, "unsubscribed");
        }

        Ok(())
    }

    async fn broadcast(&self, message: &StreamMessage) -> Result<(), Self::Error> {
        self.ensure_running()?;

        if !self.bus.publish(message.clone()).await {
            debug!(stream = %message.stream, "no subscribers");
        }

        Ok(())
    }

    async fn broadcast_command(&self, command: &RemoteCommandMessage) -> Result<(), Self::Error> {
        self.ensure_running()?;

        if self.bus.commands().send(command.clone()).is_err() {
            debug!(command = %command.command, "no nodes listening for commands");
        }

        Ok(())
    }

    fn is_multi_node(&self) -> bool {
        true
    }
}
