use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use bytes::Bytes;
use relay_common::{DisconnectMessage, REMOTE_DISCONNECT_REASON, StreamMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, debug_span, warn};

use crate::registry::Recipient;
use crate::{Encoder, Session};

/// Fan-out work handed over by the hub actor.
pub(crate) enum GateJob<S> {
    Broadcast {
        message: StreamMessage,
        recipients: Vec<Recipient<S>>,
    },
    Disconnect {
        identity: String,
        sessions: Vec<Arc<S>>,
        reconnect: bool,
    },
}

/// A fan-out worker. Jobs for the same key always land on the same gate, so
/// they are performed in the order they were queued.
pub(crate) struct Gate<S> {
    pub sender: mpsc::Sender<GateJob<S>>,
    pub handle: JoinHandle<()>,
}

impl<S: Session> Gate<S> {
    pub fn spawn<E: Encoder>(index: usize, capacity: usize, encoder: Arc<E>) -> Self {
        let (sender, mut receiver) = mpsc::channel(capacity);

        let handle = tokio::spawn(
            async move {
                while let Some(job) = receiver.recv().await {
                    match job {
                        GateJob::Broadcast {
                            message,
                            recipients,
                        } => deliver(encoder.as_ref(), &message, &recipients),
                        GateJob::Disconnect {
                            identity,
                            sessions,
                            reconnect,
                        } => disconnect(encoder.as_ref(), &identity, &sessions, reconnect),
                    }
                }

                debug!("gate stopped");
            }
            .instrument(debug_span!("gate", index)),
        );

        Self { sender, handle }
    }
}

/// Picks the gate responsible for `key`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn gate_for(key: &str, size: usize) -> usize {
    if size == 1 {
        return 0;
    }

    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);

    (hasher.finish() % size as u64) as usize
}

/// Renders the message once per identifier and sends it to every recipient.
pub(crate) fn deliver<S: Session, E: Encoder>(
    encoder: &E,
    message: &StreamMessage,
    recipients: &[Recipient<S>],
) {
    let mut rendered: HashMap<&str, Option<Bytes>> = HashMap::new();

    for recipient in recipients {
        for identifier in &recipient.identifiers {
            let payload = rendered.entry(identifier.as_str()).or_insert_with(|| {
                match encoder.encode_broadcast(message, identifier) {
                    Ok(payload) => Some(payload),
                    Err(error) => {
                        warn!(stream = %message.stream, channel = %identifier, %error, "failed to encode broadcast");
                        None
                    }
                }
            });

            if let Some(payload) = payload {
                recipient.session.send(payload.clone());
            }
        }
    }

    debug!(
        stream = %message.stream,
        sessions = recipients.len(),
        encoded = rendered.len(),
        "broadcast delivered"
    );
}

fn disconnect<S: Session, E: Encoder>(
    encoder: &E,
    identity: &str,
    sessions: &[Arc<S>],
    reconnect: bool,
) {
    let payload = match encoder.encode_disconnect(&DisconnectMessage::remote(reconnect)) {
        Ok(payload) => payload,
        Err(error) => {
            warn!(%identity, %error, "failed to encode disconnect message");
            return;
        }
    };

    for session in sessions {
        session.disconnect_with_message(payload.clone(), REMOTE_DISCONNECT_REASON);
    }

    debug!(%identity, sessions = sessions.len(), "remote disconnect performed");
}
