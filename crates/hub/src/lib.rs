//! Session registry and broadcast fan-out.
//!
//! The [`Hub`] indexes live client sessions by id, identity and stream
//! subscription, and delivers stream messages to every subscribed session,
//! rendering each message once per channel identifier.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod encoder;
mod error;
mod gate;
mod hub;
mod registry;
mod session;

pub use config::HubConfig;
pub use encoder::{Encoder, EncoderError, JsonEncoder};
pub use error::Error;
pub use hub::Hub;
pub use session::Session;
