use thiserror::Error;

/// Errors returned by the hub.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The hub has been shut down and no longer accepts work.
    #[error("hub is shut down")]
    Closed,

    /// The configuration cannot be used to start a hub.
    #[error("invalid hub configuration: {0}")]
    InvalidConfig(&'static str),
}
