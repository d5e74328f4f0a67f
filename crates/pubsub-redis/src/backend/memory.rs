//! Consumer-group log kept in process memory.
//!
//! Mirrors the parts of Redis Streams the streamer relies on: groups created
//! at the tail, pending entries per consumer, idle-time based claiming and
//! consumer removal dropping the consumer's pending entries. Every
//! [`MemoryConnector`] is an independent network link that can be made
//! unreachable, severed or stalled.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};

use super::{Connector, GroupCreated, StreamConnection, StreamEntry};
use crate::Error;

#[derive(Debug)]
struct Pending {
    consumer: String,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: u64,
    pending: BTreeMap<u64, Pending>,
    consumers: HashSet<String>,
}

#[derive(Debug, Default)]
struct Log {
    last_id: u64,
    entries: BTreeMap<u64, HashMap<String, String>>,
    groups: HashMap<String, Group>,
}

#[derive(Debug, Default)]
struct Shared {
    logs: Mutex<HashMap<String, Log>>,
    changed: Notify,
}

fn entry_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_id(id: &str) -> Result<u64, Error> {
    id.split_once('-')
        .map_or(id, |(seq, _)| seq)
        .parse()
        .map_err(|_| Error::Backend(format!("invalid stream id: {id}")))
}

fn no_group(stream: &str, group: &str) -> Error {
    Error::Backend(format!("NOGROUP no such key '{stream}' or consumer group '{group}'"))
}

/// In-memory streams shared by every connector created from it.
#[derive(Clone, Debug, Default)]
pub struct MemoryStreams {
    shared: Arc<Shared>,
}

impl MemoryStreams {
    /// Creates an empty set of streams.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A new, reachable link to these streams.
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            streams: self.clone(),
            link: Arc::new(Link {
                reachable: AtomicBool::new(true),
                stalled: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                connect_attempts: AtomicU32::new(0),
            }),
        }
    }

    /// A link that refuses every connection.
    #[must_use]
    pub fn unreachable_connector(&self) -> MemoryConnector {
        let connector = self.connector();
        connector.set_reachable(false);
        connector
    }

    /// Number of entries stored in `stream`.
    #[must_use]
    pub fn len(&self, stream: &str) -> usize {
        self.shared
            .logs
            .lock()
            .get(stream)
            .map_or(0, |log| log.entries.len())
    }

    /// Whether `stream` holds no entries.
    #[must_use]
    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    /// Number of delivered but unacknowledged entries of `group`.
    #[must_use]
    pub fn pending(&self, stream: &str, group: &str) -> usize {
        self.shared
            .logs
            .lock()
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map_or(0, |group| group.pending.len())
    }

    /// Consumers known to `group`, sorted.
    #[must_use]
    pub fn consumers(&self, stream: &str, group: &str) -> Vec<String> {
        let mut consumers: Vec<String> = self
            .shared
            .logs
            .lock()
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map(|group| group.consumers.iter().cloned().collect())
            .unwrap_or_default();
        consumers.sort();
        consumers
    }

    /// Consumer groups of `stream`, sorted.
    #[must_use]
    pub fn groups(&self, stream: &str) -> Vec<String> {
        let mut groups: Vec<String> = self
            .shared
            .logs
            .lock()
            .get(stream)
            .map(|log| log.groups.keys().cloned().collect())
            .unwrap_or_default();
        groups.sort();
        groups
    }

    /// Appends an entry carrying `fields` and returns its id.
    pub fn append(&self, stream: &str, fields: &[(&str, &str)]) -> String {
        self.append_capped(stream, fields, None)
    }

    fn append_capped(&self, stream: &str, fields: &[(&str, &str)], max_len: Option<usize>) -> String {
        let id = {
            let mut logs = self.shared.logs.lock();
            let log = logs.entry(stream.to_owned()).or_default();
            log.last_id += 1;
            log.entries.insert(
                log.last_id,
                fields
                    .iter()
                    .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
                    .collect(),
            );

            if let Some(max_len) = max_len {
                while log.entries.len() > max_len {
                    log.entries.pop_first();
                }
            }

            entry_id(log.last_id)
        };

        self.shared.changed.notify_waiters();
        id
    }

    fn create_group(&self, stream: &str, group: &str) -> GroupCreated {
        let mut logs = self.shared.logs.lock();
        let log = logs.entry(stream.to_owned()).or_default();
        if log.groups.contains_key(group) {
            return GroupCreated::AlreadyExists;
        }

        let tail = log.last_id;
        log.groups.insert(
            group.to_owned(),
            Group {
                last_delivered: tail,
                ..Group::default()
            },
        );
        GroupCreated::Created
    }

    fn deliver_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Vec<StreamEntry>, Error> {
        let mut logs = self.shared.logs.lock();
        let log = logs.get_mut(stream).ok_or_else(|| no_group(stream, group))?;
        let state = log
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream, group))?;

        state.consumers.insert(consumer.to_owned());

        let now = Instant::now();
        let mut delivered = Vec::new();
        for (&seq, fields) in log.entries.range(state.last_delivered + 1..) {
            state.pending.insert(
                seq,
                Pending {
                    consumer: consumer.to_owned(),
                    delivered_at: now,
                },
            );
            state.last_delivered = seq;
            delivered.push(StreamEntry::new(entry_id(seq), fields.clone()));
        }

        Ok(delivered)
    }

    fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Vec<StreamEntry>, Error> {
        let mut logs = self.shared.logs.lock();
        let log = logs.get_mut(stream).ok_or_else(|| no_group(stream, group))?;
        let state = log
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream, group))?;

        state.consumers.insert(consumer.to_owned());

        let now = Instant::now();
        let mut claimed = Vec::new();
        let mut deleted = Vec::new();
        for (&seq, pending) in &mut state.pending {
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }

            match log.entries.get(&seq) {
                Some(fields) => {
                    pending.consumer = consumer.to_owned();
                    pending.delivered_at = now;
                    claimed.push(StreamEntry::new(entry_id(seq), fields.clone()));
                }
                None => deleted.push(seq),
            }
        }

        for seq in deleted {
            state.pending.remove(&seq);
        }

        Ok(claimed)
    }

    fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), Error> {
        let seq = parse_id(id)?;
        let mut logs = self.shared.logs.lock();
        if let Some(state) = logs.get_mut(stream).and_then(|log| log.groups.get_mut(group)) {
            state.pending.remove(&seq);
        }
        Ok(())
    }

    fn destroy_group(&self, stream: &str, group: &str) -> Result<(), Error> {
        let mut logs = self.shared.logs.lock();
        let log = logs
            .get_mut(stream)
            .ok_or_else(|| Error::Backend(format!("ERR no such key '{stream}'")))?;
        log.groups.remove(group);
        Ok(())
    }

    fn ack_and_delete(&self, stream: &str, group: &str, id: &str) -> Result<(), Error> {
        let seq = parse_id(id)?;
        let mut logs = self.shared.logs.lock();
        if let Some(log) = logs.get_mut(stream) {
            if let Some(state) = log.groups.get_mut(group) {
                state.pending.remove(&seq);
            }
            log.entries.remove(&seq);
        }
        Ok(())
    }

    fn delete_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<(), Error> {
        let mut logs = self.shared.logs.lock();
        let state = logs
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
            .ok_or_else(|| no_group(stream, group))?;

        state.consumers.remove(consumer);
        state.pending.retain(|_, pending| pending.consumer != consumer);
        Ok(())
    }
}

#[derive(Debug)]
struct Link {
    reachable: AtomicBool,
    stalled: AtomicBool,
    epoch: AtomicU64,
    connect_attempts: AtomicU32,
}

impl Link {
    /// Never resolves while the link is stalled.
    async fn wait_unless_stalled(&self) {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

/// One network link to [`MemoryStreams`].
#[derive(Clone, Debug)]
pub struct MemoryConnector {
    streams: MemoryStreams,
    link: Arc<Link>,
}

impl MemoryConnector {
    /// Makes new connections succeed or fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.link.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Severs every live connection of this link and refuses new ones.
    pub fn crash(&self) {
        self.set_reachable(false);
        self.link.epoch.fetch_add(1, Ordering::SeqCst);
        self.streams.shared.changed.notify_waiters();
    }

    /// Makes every operation started from now on hang forever, as a peer
    /// that stopped answering would.
    pub fn stall(&self) {
        self.link.stalled.store(true, Ordering::SeqCst);
    }

    /// Number of connection attempts made so far.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.link.connect_attempts.load(Ordering::SeqCst)
    }

    /// The streams behind this link.
    #[must_use]
    pub const fn streams(&self) -> &MemoryStreams {
        &self.streams
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<Self::Connection, Error> {
        self.link.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.link.wait_unless_stalled().await;

        if !self.link.reachable.load(Ordering::SeqCst) {
            return Err(Error::Backend("connection refused".to_owned()));
        }

        Ok(MemoryConnection {
            streams: self.streams.clone(),
            link: self.link.clone(),
            epoch: self.link.epoch.load(Ordering::SeqCst),
        })
    }
}

/// A live connection made through a [`MemoryConnector`].
#[derive(Debug)]
pub struct MemoryConnection {
    streams: MemoryStreams,
    link: Arc<Link>,
    epoch: u64,
}

impl MemoryConnection {
    async fn ensure_open(&self) -> Result<(), Error> {
        self.link.wait_unless_stalled().await;

        if self.link.epoch.load(Ordering::SeqCst) == self.epoch {
            Ok(())
        } else {
            Err(Error::Backend("connection closed".to_owned()))
        }
    }
}

#[async_trait]
impl StreamConnection for MemoryConnection {
    async fn create_group(&mut self, stream: &str, group: &str) -> Result<GroupCreated, Error> {
        self.ensure_open().await?;
        Ok(self.streams.create_group(stream, group))
    }

    async fn read_group(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, Error> {
        let deadline = Instant::now() + block;

        loop {
            let changed = self.streams.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            self.ensure_open().await?;
            let entries = self.streams.deliver_new(stream, group, consumer)?;
            if !entries.is_empty() {
                return Ok(entries);
            }

            if timeout_at(deadline, changed).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn autoclaim(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Vec<StreamEntry>, Error> {
        self.ensure_open().await?;
        self.streams.claim_idle(stream, group, consumer, min_idle)
    }

    async fn ack(&mut self, stream: &str, group: &str, id: &str) -> Result<(), Error> {
        self.ensure_open().await?;
        self.streams.ack(stream, group, id)
    }

    async fn ack_and_delete(&mut self, stream: &str, group: &str, id: &str) -> Result<(), Error> {
        self.ensure_open().await?;
        self.streams.ack_and_delete(stream, group, id)
    }

    async fn delete_consumer(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<(), Error> {
        self.ensure_open().await?;
        self.streams.delete_consumer(stream, group, consumer)
    }

    async fn destroy_group(&mut self, stream: &str, group: &str) -> Result<(), Error> {
        self.ensure_open().await?;
        self.streams.destroy_group(stream, group)
    }

    async fn add(
        &mut self,
        stream: &str,
        fields: &[(&str, &str)],
        max_len: Option<usize>,
    ) -> Result<String, Error> {
        self.ensure_open().await?;
        Ok(self.streams.append_capped(stream, fields, max_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    async fn open(streams: &MemoryStreams) -> MemoryConnection {
        streams.connector().connect().await.unwrap()
    }

    #[tokio::test]
    async fn test_group_starts_at_tail() {
        let streams = MemoryStreams::new();
        streams.append("s", &[("payload", "old")]);

        let mut connection = open(&streams).await;
        assert_eq!(
            connection.create_group("s", "g").await.unwrap(),
            GroupCreated::Created
        );
        assert_eq!(
            connection.create_group("s", "g").await.unwrap(),
            GroupCreated::AlreadyExists
        );

        let entries = connection
            .read_group("s", "g", "c", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(entries.is_empty());

        streams.append("s", &[("payload", "new")]);
        let entries = connection
            .read_group("s", "g", "c", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload(), Some("new"));
        assert_eq!(streams.pending("s", "g"), 1);
    }

    #[tokio::test]
    async fn test_blocked_read_wakes_on_append() {
        let streams = MemoryStreams::new();
        let mut connection = open(&streams).await;
        connection.create_group("s", "g").await.unwrap();

        let publisher = streams.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.append("s", &[("payload", "late")]);
        });

        let entries = connection
            .read_group("s", "g", "c", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(entries[0].payload(), Some("late"));
    }

    #[tokio::test]
    async fn test_idle_entries_are_claimed_and_acked() {
        let streams = MemoryStreams::new();
        let mut first = open(&streams).await;
        let mut second = open(&streams).await;
        first.create_group("s", "g").await.unwrap();

        streams.append("s", &[("payload", "m1")]);
        first
            .read_group("s", "g", "a", Duration::from_millis(10))
            .await
            .unwrap();

        let idle = Duration::from_millis(30);
        assert!(second.autoclaim("s", "g", "b", idle).await.unwrap().is_empty());

        tokio::time::sleep(idle).await;
        let claimed = second.autoclaim("s", "g", "b", idle).await.unwrap();
        assert_eq!(claimed.len(), 1);

        second
            .ack_and_delete("s", "g", &claimed[0].id)
            .await
            .unwrap();
        assert_eq!(streams.pending("s", "g"), 0);
        assert!(streams.is_empty("s"));
    }

    #[tokio::test]
    async fn test_deleting_consumer_drops_its_pending_entries() {
        let streams = MemoryStreams::new();
        let mut connection = open(&streams).await;
        connection.create_group("s", "g").await.unwrap();
        streams.append("s", &[("payload", "m1")]);
        connection
            .read_group("s", "g", "a", Duration::from_millis(10))
            .await
            .unwrap();

        connection.delete_consumer("s", "g", "a").await.unwrap();

        assert_eq!(streams.pending("s", "g"), 0);
        assert!(streams.consumers("s", "g").is_empty());
    }

    #[tokio::test]
    async fn test_crash_severs_live_connections() {
        let streams = MemoryStreams::new();
        let connector = streams.connector();
        let mut connection = connector.connect().await.unwrap();
        connection.create_group("s", "g").await.unwrap();

        let reader = tokio::spawn(async move {
            connection
                .read_group("s", "g", "c", Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        connector.crash();

        assert_matches!(reader.await.unwrap(), Err(Error::Backend(_)));
        assert_matches!(connector.connect().await, Err(Error::Backend(_)));
        assert_eq!(connector.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_groups_read_independently_and_trimming_caps_the_stream() {
        let streams = MemoryStreams::new();
        let mut connection = open(&streams).await;
        connection.create_group("s", "node-a").await.unwrap();
        connection.create_group("s", "node-b").await.unwrap();

        for value in ["m1", "m2", "m3"] {
            connection
                .add("s", &[("payload", value)], Some(2))
                .await
                .unwrap();
        }
        assert_eq!(streams.len("s"), 2);

        let first = connection
            .read_group("s", "node-a", "a", Duration::from_millis(10))
            .await
            .unwrap();
        let payloads: Vec<_> = first.iter().filter_map(StreamEntry::payload).collect();
        assert_eq!(payloads, ["m2", "m3"]);

        for entry in &first {
            connection.ack("s", "node-a", &entry.id).await.unwrap();
        }
        assert_eq!(streams.pending("s", "node-a"), 0);
        assert_eq!(streams.len("s"), 2);

        let second = connection
            .read_group("s", "node-b", "b", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(second.len(), 2);

        connection.destroy_group("s", "node-b").await.unwrap();
        assert_eq!(streams.groups("s"), ["node-a"]);
    }

    #[tokio::test]
    async fn test_stalled_link_hangs() {
        let streams = MemoryStreams::new();
        let connector = streams.connector();
        let mut connection = connector.connect().await.unwrap();

        connector.stall();

        assert!(
            tokio::time::timeout(Duration::from_millis(50), connection.create_group("s", "g"))
                .await
                .is_err()
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(50), connector.connect())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_read_without_group_fails() {
        let streams = MemoryStreams::new();
        let mut connection = open(&streams).await;

        assert_matches!(
            connection
                .read_group("s", "g", "c", Duration::from_millis(10))
                .await,
            Err(Error::Backend(_))
        );
    }
}
