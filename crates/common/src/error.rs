use thiserror::Error;

/// Errors raised while decoding or encoding relay messages.
#[derive(Debug, Error)]
pub enum Error {
    /// Payload is not valid JSON or does not match the expected shape.
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload is valid JSON but not one of the supported message kinds.
    #[error("unsupported payload: {0}")]
    UnsupportedPayload(&'static str),

    /// Command payload is not valid UTF-8.
    #[error("command payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}
