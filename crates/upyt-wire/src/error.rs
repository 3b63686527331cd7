//! Error types for the wire protocol.

use thiserror::Error;

/// Errors that can occur when encoding or decoding protocol lines.
#[derive(Debug, Error)]
pub enum WireError {
    /// A line decoded to `null`, which is reserved as the "no response" sentinel.
    #[error("received {line:?} which decodes to null; null is reserved and must not be transmitted")]
    ReservedValue {
        /// The offending line, without its terminator.
        line: String,
    },

    /// A request carried a recognised key with a value of the wrong type.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// A call argument has the wrong type.
    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument {
        /// Parameter name.
        name: String,
        /// Why conversion failed.
        reason: String,
    },

    /// A required call argument is absent.
    #[error("missing argument '{0}'")]
    MissingArgument(String),

    /// A value could not be converted to or from JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for wire operations.
pub type WireResult<T> = Result<T, WireError>;
