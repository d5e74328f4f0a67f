use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use relay_common::StreamMessage;

use crate::Session;

type NestedIndex = HashMap<String, HashMap<String, HashSet<String>>>;

/// Outcome of registering a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Registered {
    New,
    Replaced,
}

/// A session together with the identifiers it is subscribed under.
pub(crate) struct Recipient<S> {
    pub session: Arc<S>,
    pub identifiers: Vec<String>,
}

/// Session and subscription indexes.
///
/// Owned by the hub actor, so none of this is synchronized. `streams` and
/// `reverse` mirror each other and empty sets are pruned eagerly.
pub(crate) struct Registry<S> {
    /// id -> session
    sessions: HashMap<String, Arc<S>>,

    /// identity -> ids
    identities: HashMap<String, HashSet<String>>,

    /// stream -> id -> identifiers
    streams: NestedIndex,

    /// id -> identifier -> streams
    reverse: NestedIndex,
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
            identities: HashMap::new(),
            streams: HashMap::new(),
            reverse: HashMap::new(),
        }
    }
}

impl<S: Session> Registry<S> {
    /// Registers a session. A known id gets its handle replaced while its
    /// subscriptions are kept.
    pub fn add(&mut self, session: Arc<S>) -> Registered {
        let id = session.id().to_owned();
        let identity = session.identity().to_owned();

        let previous = self.sessions.insert(id.clone(), session);

        if let Some(previous) = &previous {
            if previous.identity() != identity {
                self.forget_identity(previous.identity(), &id);
            }
        }

        self.identities.entry(identity).or_default().insert(id);

        if previous.is_some() {
            Registered::Replaced
        } else {
            Registered::New
        }
    }

    /// Drops a session and every subscription it holds.
    pub fn remove(&mut self, id: &str) -> Option<Arc<S>> {
        let session = self.sessions.remove(id)?;

        if let Some(channels) = self.reverse.remove(id) {
            for (identifier, streams) in channels {
                for stream in streams {
                    remove_nested(&mut self.streams, &stream, id, &identifier);
                }
            }
        }

        self.forget_identity(session.identity(), id);

        Some(session)
    }

    /// Returns `false` when the session is unknown.
    pub fn subscribe(&mut self, id: &str, stream: &str, identifier: &str) -> bool {
        if !self.sessions.contains_key(id) {
            return false;
        }

        self.streams
            .entry(stream.to_owned())
            .or_default()
            .entry(id.to_owned())
            .or_default()
            .insert(identifier.to_owned());

        self.reverse
            .entry(id.to_owned())
            .or_default()
            .entry(identifier.to_owned())
            .or_default()
            .insert(stream.to_owned());

        true
    }

    /// Returns `false` when there was no such subscription.
    pub fn unsubscribe(&mut self, id: &str, stream: &str, identifier: &str) -> bool {
        if !remove_nested(&mut self.reverse, id, identifier, stream) {
            return false;
        }

        remove_nested(&mut self.streams, stream, id, identifier);
        true
    }

    /// Drops every stream of one identifier and returns how many there were.
    pub fn unsubscribe_channel(&mut self, id: &str, identifier: &str) -> usize {
        let Some(channels) = self.reverse.get_mut(id) else {
            return 0;
        };

        let Some(streams) = channels.remove(identifier) else {
            return 0;
        };

        if channels.is_empty() {
            self.reverse.remove(id);
        }

        for stream in &streams {
            remove_nested(&mut self.streams, stream, id, identifier);
        }

        streams.len()
    }

    /// Snapshot of everyone who should receive `message`.
    pub fn recipients(&self, message: &StreamMessage) -> Vec<Recipient<S>> {
        let Some(subscribers) = self.streams.get(&message.stream) else {
            return Vec::new();
        };

        let excluded = message.excluded_session();

        subscribers
            .iter()
            .filter(|(id, _)| excluded != Some(id.as_str()))
            .filter_map(|(id, identifiers)| {
                self.sessions.get(id).map(|session| Recipient {
                    session: Arc::clone(session),
                    identifiers: identifiers.iter().cloned().collect(),
                })
            })
            .collect()
    }

    pub fn identity_sessions(&self, identity: &str) -> Vec<Arc<S>> {
        self.identities
            .get(identity)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.sessions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn find_by_identity(&self, identity: &str) -> Option<Arc<S>> {
        self.identities
            .get(identity)?
            .iter()
            .find_map(|id| self.sessions.get(id).cloned())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn sessions(&self) -> Vec<Arc<S>> {
        self.sessions.values().cloned().collect()
    }

    pub fn size(&self) -> usize {
        self.sessions.len()
    }

    pub fn uniq_size(&self) -> usize {
        self.identities.len()
    }

    pub fn streams_size(&self) -> usize {
        self.streams.len()
    }

    /// Checks that the indexes mirror each other and hold no empty sets.
    pub fn is_consistent(&self) -> bool {
        let streams_mirrored = self.streams.iter().all(|(stream, subscribers)| {
            !subscribers.is_empty()
                && subscribers.iter().all(|(id, identifiers)| {
                    !identifiers.is_empty()
                        && self.sessions.contains_key(id)
                        && identifiers
                            .iter()
                            .all(|identifier| contains_nested(&self.reverse, id, identifier, stream))
                })
        });

        let reverse_mirrored = self.reverse.iter().all(|(id, channels)| {
            !channels.is_empty()
                && channels.iter().all(|(identifier, streams)| {
                    !streams.is_empty()
                        && streams
                            .iter()
                            .all(|stream| contains_nested(&self.streams, stream, id, identifier))
                })
        });

        let identities_mirrored = self.identities.iter().all(|(identity, ids)| {
            !ids.is_empty()
                && ids.iter().all(|id| {
                    self.sessions
                        .get(id)
                        .is_some_and(|session| session.identity() == identity)
                })
        }) && self.sessions.iter().all(|(id, session)| {
            self.identities
                .get(session.identity())
                .is_some_and(|ids| ids.contains(id))
        });

        streams_mirrored && reverse_mirrored && identities_mirrored
    }

    fn forget_identity(&mut self, identity: &str, id: &str) {
        if let Some(ids) = self.identities.get_mut(identity) {
            ids.remove(id);

            if ids.is_empty() {
                self.identities.remove(identity);
            }
        }
    }
}

fn remove_nested(index: &mut NestedIndex, outer: &str, middle: &str, inner: &str) -> bool {
    let Some(middles) = index.get_mut(outer) else {
        return false;
    };

    let Some(inners) = middles.get_mut(middle) else {
        return false;
    };

    let removed = inners.remove(inner);

    if inners.is_empty() {
        middles.remove(middle);
    }

    if middles.is_empty() {
        index.remove(outer);
    }

    removed
}

fn contains_nested(index: &NestedIndex, outer: &str, middle: &str, inner: &str) -> bool {
    index
        .get(outer)
        .and_then(|middles| middles.get(middle))
        .is_some_and(|inners| inners.contains(inner))
}
