//! In-process subscribers.
//!
//! [`LegacySubscriber`] loops everything back to the local handler and suits
//! single-node deployments. [`MemorySubscriber`] instances sharing a
//! [`MemoryBus`] behave like separate nodes attached to one pub/sub server.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod bus;
mod error;
mod legacy;
mod subscriber;

pub use bus::MemoryBus;
pub use error::Error;
pub use legacy::LegacySubscriber;
pub use subscriber::MemorySubscriber;
