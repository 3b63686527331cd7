//! Error types for the host side.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use upyt_wire::WireError;

/// Diagnostic text a device wrote instead of an acknowledgement.
///
/// Carries every line the receiver collected, in order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote fault: {}", .lines.join(" | "))]
pub struct RemoteError {
    /// Diagnostic lines, without terminators.
    pub lines: Vec<String>,
}

impl RemoteError {
    /// Wrap collected diagnostic lines.
    pub fn new(lines: Vec<String>) -> Self {
        RemoteError { lines }
    }

    /// The diagnostic text, one line per device line.
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }
}

/// Errors surfaced to callers of a connection.
#[derive(Debug, Error)]
pub enum HostError {
    /// No response arrived within the timeout. The connection is still usable.
    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),

    /// A request was not acknowledged within the timeout.
    #[error("request not acknowledged within {0:?}")]
    AckTimeout(Duration),

    /// The device reported a fault. The connection has been halted.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The connection is halted or closed.
    #[error("connection is closing")]
    Closing,

    /// The device does not offer this instruction.
    #[error("device has no instruction '{0}'")]
    UnknownInstruction(String),

    /// The device does not offer this remote class.
    #[error("device has no remote class '{0}'")]
    UnknownClass(String),

    /// The device sent a line that decodes to `null`.
    #[error("device sent reserved null value in line {0:?}")]
    ReservedValue(String),

    /// A response did not have the expected shape.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The serial link failed.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Encoding or decoding failed.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The project configuration is missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A worker thread could not be started.
    #[error("failed to start {name} worker: {source}")]
    Worker {
        /// Worker name.
        name: &'static str,
        /// Spawn failure.
        source: io::Error,
    },
}

/// Result type alias for host operations.
pub type HostResult<T> = Result<T, HostError>;

/// Errors opening or locating a serial link.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The serial driver failed.
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Reading or writing failed.
    #[error("link i/o error: {0}")]
    Io(#[from] io::Error),

    /// No connected port has this USB serial number.
    #[error("no connected device with serial number '{0}'")]
    NotFound(String),

    /// More than one port has this USB serial number.
    #[error("serial number '{serial}' matches several ports: {}", .ports.join(", "))]
    Ambiguous {
        /// Requested serial number.
        serial: String,
        /// Matching port names.
        ports: Vec<String>,
    },
}

/// Errors loading the project configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// The file is not valid YAML for the expected schema.
    #[error("invalid configuration in {path}: {source}")]
    Yaml {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: serde_yaml::Error,
    },

    /// No configuration file was found in any search location.
    #[error("no .upytester.yml found (searched {})", .searched.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    NotFound {
        /// Locations searched.
        searched: Vec<PathBuf>,
    },

    /// The configuration does not name this device.
    #[error("device '{0}' is not configured")]
    UnknownDevice(String),
}
