//! Boundary between pub/sub backends and the hub.
//!
//! A [`Subscriber`] moves stream messages and remote commands between
//! server instances; whatever it receives is handed to a
//! [`BroadcastHandler`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod dispatch;
mod handler;
mod subscriber;

/// Black-box checks every subscriber implementation must pass.
#[cfg(any(test, feature = "test-helpers"))]
pub mod conformance;

pub use dispatch::{DispatchError, dispatch_message, dispatch_payload};
pub use handler::{BroadcastHandler, HandlerError};
pub use subscriber::{ErrorSink, Subscriber, SubscriberError};
