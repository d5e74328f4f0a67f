use relay_hub::HubConfig;
use relay_pubsub_redis::RedisSubscriberConfig;
use serde::{Deserialize, Serialize};

/// Settings of one relay node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hub settings.
    pub hub: HubConfig,

    /// Pub/sub backend.
    pub pubsub: PubSubAdapter,
}

/// Pub/sub backend connecting nodes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "adapter", rename_all = "snake_case")]
pub enum PubSubAdapter {
    /// Single node; everything loops back locally.
    #[default]
    Legacy,

    /// Nodes of one process sharing an in-memory bus.
    Memory,

    /// Nodes sharing a Redis stream.
    Redis(RedisSubscriberConfig),
}
