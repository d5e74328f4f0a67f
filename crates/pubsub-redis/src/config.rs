use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Redis connection settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis URL, e.g. `redis://localhost:6379`.
    pub url: String,

    /// Consecutive failures after which a consumer gives up.
    pub max_reconnect_attempts: u32,

    /// Timeout for establishing a connection, in milliseconds.
    pub connect_timeout_ms: u64,

    /// Delay before the first reconnect, in milliseconds.
    pub reconnect_base_delay_ms: u64,

    /// Upper bound for reconnect delays, in milliseconds.
    pub reconnect_max_delay_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_owned(),
            max_reconnect_attempts: 5,
            connect_timeout_ms: 1000,
            reconnect_base_delay_ms: 250,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl RedisConfig {
    /// Reconnect policy derived from these settings.
    #[must_use]
    pub const fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
        }
    }

    /// Connection timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// How a consumer recovers from backend failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failures after which the consumer stops for good.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound for any delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        RedisConfig::default().reconnect_policy()
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `step` (zero based).
    ///
    /// The first retry waits the base delay. Retry `n` waits a random
    /// duration in `[base * 2^(n+2), base * 2^(n+3))`, capped at the maximum.
    #[must_use]
    pub fn delay(&self, step: u32) -> Duration {
        if step == 0 {
            return self.base_delay.min(self.max_delay);
        }

        let left = self.base_delay.saturating_mul(1 << (step + 2).min(30));
        let jittered = left.mul_f64(1.0 + fastrand::f64());

        jittered.min(self.max_delay)
    }
}

/// How a consumer relates to the other members of its group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupMembership {
    /// Consumers compete for entries. Handled entries are deleted from the
    /// stream and a stopping consumer leaves the group.
    #[default]
    Shared,

    /// The group belongs to this consumer alone. Handled entries stay in the
    /// stream for other groups and the group is destroyed on shutdown.
    Exclusive,
}

/// Settings of one stream consumer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamerConfig {
    /// Stream to consume.
    pub stream: String,

    /// Consumer group shared by all cooperating consumers.
    pub group: String,

    /// Name of this consumer within the group. A random name is generated
    /// when absent.
    #[serde(default)]
    pub consumer_name: Option<String>,

    /// How long a read blocks waiting for entries, in milliseconds. Also the
    /// idle time after which pending entries of other consumers are claimed.
    pub block_ms: u64,

    /// Whether the group is shared with other consumers.
    #[serde(default)]
    pub membership: GroupMembership,
}

impl StreamerConfig {
    /// Creates a config with a generated consumer name.
    pub fn new(stream: impl Into<String>, group: impl Into<String>, block_ms: u64) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer_name: None,
            block_ms,
            membership: GroupMembership::Shared,
        }
    }

    /// Block duration.
    #[must_use]
    pub const fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.stream.is_empty() {
            return Err(Error::InvalidConfig("stream name must not be empty".to_owned()));
        }

        if self.group.is_empty() {
            return Err(Error::InvalidConfig("group name must not be empty".to_owned()));
        }

        if self.consumer_name.as_deref() == Some("") {
            return Err(Error::InvalidConfig("consumer name must not be empty".to_owned()));
        }

        if self.block_ms == 0 {
            return Err(Error::InvalidConfig("block_ms must be positive".to_owned()));
        }

        Ok(())
    }
}

/// Settings of the Redis streams subscriber.
///
/// Published payloads land on `stream`, where the instances compete for
/// them through `group`. The instance taking a payload relays it to the
/// fan-out stream (`<stream>:fanout`), which every instance reads through a
/// group of its own (`<group>:<consumer>`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSubscriberConfig {
    /// Connection settings.
    pub redis: RedisConfig,

    /// Stream receiving published broadcasts and commands.
    pub stream: String,

    /// Consumer group of the server instances.
    pub group: String,

    /// Name of this instance. A random name is generated when absent.
    pub consumer_name: Option<String>,

    /// Read block duration, in milliseconds.
    pub block_ms: u64,

    /// Approximate number of entries kept in the fan-out stream.
    pub fanout_max_len: usize,

    /// Upper bound for shutting down, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for RedisSubscriberConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            stream: "__relay__".to_owned(),
            group: "bx".to_owned(),
            consumer_name: None,
            block_ms: 2000,
            fanout_max_len: 10_000,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl RedisSubscriberConfig {
    /// Consumer settings for the shared ingress stream.
    #[must_use]
    pub fn ingress(&self, consumer: &str) -> StreamerConfig {
        StreamerConfig {
            consumer_name: Some(consumer.to_owned()),
            ..StreamerConfig::new(self.stream.clone(), self.group.clone(), self.block_ms)
        }
    }

    /// Consumer settings for this instance's view of the fan-out stream.
    #[must_use]
    pub fn fanout(&self, consumer: &str) -> StreamerConfig {
        StreamerConfig {
            consumer_name: Some(consumer.to_owned()),
            membership: GroupMembership::Exclusive,
            ..StreamerConfig::new(
                self.fanout_stream(),
                format!("{}:{consumer}", self.group),
                self.block_ms,
            )
        }
    }

    /// Stream every instance reads in full.
    #[must_use]
    pub fn fanout_stream(&self) -> String {
        format!("{}:fanout", self.stream)
    }

    /// Read block duration.
    #[must_use]
    pub const fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    /// Shutdown bound.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.fanout_max_len == 0 {
            return Err(Error::InvalidConfig("fanout_max_len must be positive".to_owned()));
        }

        if self.shutdown_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "shutdown_timeout_ms must be positive".to_owned(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn first_retry_waits_base_delay() {
        assert_eq!(
            ReconnectPolicy::default().delay(0),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn later_retries_grow_and_stay_capped() {
        let policy = ReconnectPolicy::default();

        for _ in 0..20 {
            let first = policy.delay(1);
            assert!(first >= Duration::from_secs(2) && first < Duration::from_secs(4));

            let second = policy.delay(2);
            assert!(second >= Duration::from_secs(4) && second < Duration::from_secs(8));

            assert!(policy.delay(40) <= Duration::from_secs(30));
        }
    }

    #[test]
    fn rejects_zero_block() {
        assert_matches!(
            StreamerConfig::new("s", "g", 0).validate(),
            Err(Error::InvalidConfig(_))
        );
        assert_matches!(
            StreamerConfig::new("", "g", 10).validate(),
            Err(Error::InvalidConfig(_))
        );
        assert!(StreamerConfig::new("s", "g", 10).validate().is_ok());
    }

    #[test]
    fn subscriber_streams_and_groups() {
        let config = RedisSubscriberConfig::default();

        let ingress = config.ingress("n1");
        assert_eq!(ingress.stream, "__relay__");
        assert_eq!(ingress.group, "bx");
        assert_eq!(ingress.membership, GroupMembership::Shared);

        let fanout = config.fanout("n1");
        assert_eq!(fanout.stream, "__relay__:fanout");
        assert_eq!(fanout.group, "bx:n1");
        assert_eq!(fanout.consumer_name.as_deref(), Some("n1"));
        assert_eq!(fanout.membership, GroupMembership::Exclusive);

        assert_matches!(
            RedisSubscriberConfig {
                fanout_max_len: 0,
                ..RedisSubscriberConfig::default()
            }
            .validate(),
            Err(Error::InvalidConfig(_))
        );
    }
}
