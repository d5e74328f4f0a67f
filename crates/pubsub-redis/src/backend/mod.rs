//! Wire contract of a consumer-group log.

#[cfg(any(test, feature = "test-helpers"))]
pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::Error;

/// Name of the entry field carrying the published payload.
pub const PAYLOAD_FIELD: &str = "payload";

/// One entry read from a stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamEntry {
    /// Entry id assigned by the log.
    pub id: String,

    /// Entry fields.
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    /// Creates an entry.
    pub fn new(id: impl Into<String>, fields: HashMap<String, String>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Value of `name`, if present.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// The published payload, if present.
    #[must_use]
    pub fn payload(&self) -> Option<&str> {
        self.field(PAYLOAD_FIELD)
    }
}

/// Outcome of creating a consumer group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupCreated {
    /// The group was created at the tail of the stream.
    Created,

    /// The group existed already.
    AlreadyExists,
}

/// Opens connections to the log.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connection type.
    type Connection: StreamConnection;

    /// Opens a new connection.
    async fn connect(&self) -> Result<Self::Connection, Error>;
}

/// A live connection speaking consumer-group semantics.
#[async_trait]
pub trait StreamConnection: Send + 'static {
    /// Creates `group` on `stream` positioned at the tail, creating the
    /// stream when needed.
    async fn create_group(&mut self, stream: &str, group: &str) -> Result<GroupCreated, Error>;

    /// Reads entries never delivered to any consumer of the group, blocking
    /// for up to `block` when there are none.
    async fn read_group(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, Error>;

    /// Transfers entries pending longer than `min_idle` to `consumer` and
    /// returns them.
    async fn autoclaim(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Vec<StreamEntry>, Error>;

    /// Acknowledges one entry, leaving it in the stream for other groups.
    async fn ack(&mut self, stream: &str, group: &str, id: &str) -> Result<(), Error>;

    /// Acknowledges and deletes one entry atomically.
    async fn ack_and_delete(&mut self, stream: &str, group: &str, id: &str) -> Result<(), Error>;

    /// Removes `consumer` from the group.
    async fn delete_consumer(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<(), Error>;

    /// Removes `group` together with its consumers and pending entries.
    async fn destroy_group(&mut self, stream: &str, group: &str) -> Result<(), Error>;

    /// Appends an entry and returns its id. With `max_len`, older entries are
    /// trimmed so that roughly that many remain.
    async fn add(
        &mut self,
        stream: &str,
        fields: &[(&str, &str)],
        max_len: Option<usize>,
    ) -> Result<String, Error>;
}
