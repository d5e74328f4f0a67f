//! Redis Streams over a multiplexed connection.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Value, from_redis_value};
use tracing::debug;

use super::{Connector, GroupCreated, StreamConnection, StreamEntry};
use crate::{Error, RedisConfig};

type ReadReply = Option<Vec<(String, Vec<(String, HashMap<String, String>)>)>>;
type ClaimedEntries = Vec<(String, Option<HashMap<String, String>>)>;

/// Opens connections to a Redis server.
#[derive(Clone, Debug)]
pub struct RedisConnector {
    client: Client,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl RedisConnector {
    /// Creates a connector for `config.url`.
    ///
    /// `response_timeout` must exceed the block duration of any read issued
    /// through the connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the URL cannot be parsed.
    pub fn new(config: &RedisConfig, response_timeout: Duration) -> Result<Self, Error> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| Error::InvalidConfig(format!("invalid redis url: {e}")))?;

        Ok(Self {
            client,
            connect_timeout: config.connect_timeout(),
            response_timeout,
        })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Connection = RedisConnection;

    async fn connect(&self) -> Result<Self::Connection, Error> {
        let connection = self
            .client
            .get_multiplexed_async_connection_with_timeouts(
                self.response_timeout,
                self.connect_timeout,
            )
            .await?;

        debug!("connected to redis");

        Ok(RedisConnection { connection })
    }
}

/// A live Redis connection.
pub struct RedisConnection {
    connection: MultiplexedConnection,
}

#[allow(clippy::cast_possible_truncation)]
const fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

fn into_entries(raw: Vec<(String, HashMap<String, String>)>) -> Vec<StreamEntry> {
    raw.into_iter()
        .map(|(id, fields)| StreamEntry::new(id, fields))
        .collect()
}

#[async_trait]
impl StreamConnection for RedisConnection {
    async fn create_group(&mut self, stream: &str, group: &str) -> Result<GroupCreated, Error> {
        let result: Result<(), _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut self.connection)
            .await;

        match result {
            Ok(()) => Ok(GroupCreated::Created),
            Err(error) if error.code() == Some("BUSYGROUP") => Ok(GroupCreated::AlreadyExists),
            Err(error) => Err(error.into()),
        }
    }

    async fn read_group(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, Error> {
        let reply: ReadReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("BLOCK")
            .arg(millis(block))
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut self.connection)
            .await?;

        Ok(reply
            .unwrap_or_default()
            .into_iter()
            .filter(|(name, _)| name == stream)
            .flat_map(|(_, entries)| into_entries(entries))
            .collect())
    }

    async fn autoclaim(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Vec<StreamEntry>, Error> {
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(millis(min_idle))
            .arg("0-0")
            .query_async(&mut self.connection)
            .await?;

        let items = match reply {
            Value::Nil => return Ok(Vec::new()),
            Value::Array(items) if items.len() >= 2 => items,
            other => {
                return Err(Error::Protocol {
                    command: "XAUTOCLAIM",
                    details: format!("expected [cursor, entries, ...], got {other:?}"),
                });
            }
        };

        let claimed: ClaimedEntries = from_redis_value(&items[1]).map_err(|e| Error::Protocol {
            command: "XAUTOCLAIM",
            details: e.to_string(),
        })?;

        // Entries deleted while pending come back without fields.
        Ok(claimed
            .into_iter()
            .filter_map(|(id, fields)| fields.map(|fields| StreamEntry::new(id, fields)))
            .collect())
    }

    async fn ack(&mut self, stream: &str, group: &str, id: &str) -> Result<(), Error> {
        let _acked: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id)
            .query_async(&mut self.connection)
            .await?;

        Ok(())
    }

    async fn ack_and_delete(&mut self, stream: &str, group: &str, id: &str) -> Result<(), Error> {
        let () = redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id)
            .ignore()
            .cmd("XDEL")
            .arg(stream)
            .arg(id)
            .ignore()
            .query_async(&mut self.connection)
            .await?;

        Ok(())
    }

    async fn delete_consumer(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<(), Error> {
        let _pending: i64 = redis::cmd("XGROUP")
            .arg("DELCONSUMER")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .query_async(&mut self.connection)
            .await?;

        Ok(())
    }

    async fn destroy_group(&mut self, stream: &str, group: &str) -> Result<(), Error> {
        let _destroyed: i64 = redis::cmd("XGROUP")
            .arg("DESTROY")
            .arg(stream)
            .arg(group)
            .query_async(&mut self.connection)
            .await?;

        Ok(())
    }

    async fn add(
        &mut self,
        stream: &str,
        fields: &[(&str, &str)],
        max_len: Option<usize>,
    ) -> Result<String, Error> {
        let mut command = redis::cmd("XADD");
        command.arg(stream);
        if let Some(max_len) = max_len {
            command.arg("MAXLEN").arg("~").arg(max_len);
        }
        command.arg("*");
        for (name, value) in fields {
            command.arg(*name).arg(*value);
        }

        let id: String = command.query_async(&mut self.connection).await?;

        Ok(id)
    }
}
