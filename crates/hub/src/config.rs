use serde::{Deserialize, Serialize};

/// Hub sizing.
///
/// Every queue is bounded; callers wait when the queue they feed is full.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Number of gate workers performing fan-out.
    pub pool_size: usize,

    /// Capacity of the session registration queue.
    pub register_queue: usize,

    /// Capacity of the subscription queue.
    pub subscribe_queue: usize,

    /// Capacity of the broadcast queue.
    pub broadcast_queue: usize,

    /// Capacity of the remote disconnect queue.
    pub disconnect_queue: usize,

    /// Capacity of each gate's work queue.
    pub gate_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            pool_size: 16,
            register_queue: 2048,
            subscribe_queue: 2048,
            broadcast_queue: 256,
            disconnect_queue: 128,
            gate_queue: 256,
        }
    }
}

impl HubConfig {
    pub(crate) fn validate(&self) -> Result<(), crate::Error> {
        if self.pool_size == 0 {
            return Err(crate::Error::InvalidConfig("pool_size must be positive"));
        }

        if self.register_queue == 0
            || self.subscribe_queue == 0
            || self.broadcast_queue == 0
            || self.disconnect_queue == 0
            || self.gate_queue == 0
        {
            return Err(crate::Error::InvalidConfig("queue capacities must be positive"));
        }

        Ok(())
    }
}
