//! A relay server instance.
//!
//! [`Node`] wires the local [`Hub`](relay_hub::Hub) to the pub/sub backend
//! chosen in [`NodeConfig`]: broadcasts and remote commands are published
//! through the backend and whatever the backend receives is handed to the
//! hub by [`HubHandler`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod error;
mod handler;
mod interest;
mod node;
mod subscriber;

pub use config::{NodeConfig, PubSubAdapter};
pub use error::Error;
pub use handler::HubHandler;
pub use node::Node;
pub use subscriber::AnySubscriber;
