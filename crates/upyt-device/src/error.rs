//! Error types for the device-side engine.

use std::io;

use thiserror::Error;
use upyt_wire::WireError;

/// Errors raised while dispatching a request.
///
/// Any of these aborts the listener: the host learns about it from the
/// diagnostic text written in place of the acknowledgement.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No live instance has this id.
    #[error("unknown remote instance id {0}")]
    UnknownInstance(u64),

    /// No remote class is registered under this name.
    #[error("unknown remote class '{0}'")]
    UnknownClass(String),

    /// The named attribute of an instance cannot be invoked.
    #[error("'{method}' of remote class '{class}' is not callable")]
    NotCallable {
        /// Class of the target instance.
        class: String,
        /// Requested method.
        method: String,
    },

    /// An object reference names a class other than the instance's.
    #[error("referenced object {idx} is a '{actual}', not a '{expected}'")]
    ReferenceMismatch {
        /// Instance id from the reference.
        idx: u64,
        /// Class named by the reference.
        expected: String,
        /// Class of the live instance.
        actual: String,
    },

    /// The instance is already executing a method (re-entrant call).
    #[error("remote instance {0} is busy")]
    InstanceBusy(u64),

    /// Bad request or argument.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// A handler failed for its own reasons.
    #[error("{0}")]
    Failed(String),
}

impl DeviceError {
    /// Convenience constructor for handler failures.
    pub fn failed(msg: impl Into<String>) -> Self {
        DeviceError::Failed(msg.into())
    }
}

/// Result type alias for dispatch operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors detected while building the registry. These are configuration
/// mistakes and are meant to stop the device at startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// The name is already taken in this namespace.
    #[error("duplicate {kind} '{name}'")]
    DuplicateName {
        /// "instruction" or "remote class".
        kind: &'static str,
        /// The repeated name.
        name: String,
    },

    /// Names must be non-empty and free of whitespace.
    #[error("invalid name {0:?}")]
    InvalidName(String),
}

/// Reasons the listener loop stopped abnormally.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Dispatching a request failed; the fault report has been written.
    #[error("dispatch fault: {0}")]
    Fault(DeviceError),

    /// The byte stream failed.
    #[error("stream error: {0}")]
    Io(#[from] io::Error),

    /// A response could not be encoded.
    #[error(transparent)]
    Wire(#[from] WireError),
}
