use std::error::Error;

use async_trait::async_trait;

use crate::StreamEntry;

/// Marker trait for stream handler errors.
pub trait StreamHandlerError: Error + Send + Sync + 'static {}

impl StreamHandlerError for crate::Error {}

/// Processes entries consumed by a [`Streamer`](crate::Streamer).
///
/// Entries are acknowledged only after `handle` succeeds, and the same entry
/// may be handled more than once.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    /// The error type for the handler.
    type Error: StreamHandlerError;

    /// Handles one entry.
    async fn handle(&self, entry: &StreamEntry) -> Result<(), Self::Error>;
}
