use std::collections::{HashMap, HashSet};

/// Tracks which streams local sessions are interested in, so the backend is
/// subscribed on the first interest and unsubscribed after the last.
#[derive(Debug, Default)]
pub(crate) struct Interest {
    sessions: HashMap<String, HashSet<(String, String)>>,
    streams: HashMap<String, usize>,
}

impl Interest {
    /// Records a subscription. Returns `true` if `stream` had no interest.
    pub fn subscribe(&mut self, sid: &str, stream: &str, identifier: &str) -> bool {
        let added = self
            .sessions
            .entry(sid.to_owned())
            .or_default()
            .insert((stream.to_owned(), identifier.to_owned()));

        if !added {
            return false;
        }

        let count = self.streams.entry(stream.to_owned()).or_default();
        *count += 1;
        *count == 1
    }

    /// Drops a subscription. Returns `true` if it was the last for `stream`.
    pub fn unsubscribe(&mut self, sid: &str, stream: &str, identifier: &str) -> bool {
        let Some(subscriptions) = self.sessions.get_mut(sid) else {
            return false;
        };

        if !subscriptions.remove(&(stream.to_owned(), identifier.to_owned())) {
            return false;
        }

        if subscriptions.is_empty() {
            self.sessions.remove(sid);
        }

        self.release(stream)
    }

    /// Drops every subscription of `sid` under `identifier`. Returns the
    /// streams left without interest.
    pub fn unsubscribe_channel(&mut self, sid: &str, identifier: &str) -> Vec<String> {
        let Some(subscriptions) = self.sessions.get_mut(sid) else {
            return Vec::new();
        };

        let dropped: Vec<(String, String)> = subscriptions
            .iter()
            .filter(|(_, id)| id == identifier)
            .cloned()
            .collect();
        for subscription in &dropped {
            subscriptions.remove(subscription);
        }

        if subscriptions.is_empty() {
            self.sessions.remove(sid);
        }

        dropped
            .into_iter()
            .filter_map(|(stream, _)| self.release(&stream).then_some(stream))
            .collect()
    }

    /// Drops every subscription of `sid`. Returns the streams left without
    /// interest.
    pub fn remove_session(&mut self, sid: &str) -> Vec<String> {
        let Some(subscriptions) = self.sessions.remove(sid) else {
            return Vec::new();
        };

        subscriptions
            .into_iter()
            .filter_map(|(stream, _)| self.release(&stream).then_some(stream))
            .collect()
    }

    /// Number of streams with interest.
    pub fn streams(&self) -> usize {
        self.streams.len()
    }

    fn release(&mut self, stream: &str) -> bool {
        let Some(count) = self.streams.get_mut(stream) else {
            return false;
        };

        *count -= 1;
        if *count == 0 {
            self.streams.remove(stream);
            true
        } else {
            false
        }
    }
}
