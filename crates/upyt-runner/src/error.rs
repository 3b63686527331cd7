//! Error types for the runner.

use thiserror::Error;
use upyt_device::{ListenerError, RegistrationError};
use upyt_host::HostError;

/// Errors surfaced by runner commands and the simulated board.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Host-side failure (link, protocol or remote fault).
    #[error(transparent)]
    Host(#[from] HostError),

    /// The simulated board's listener failed.
    #[error("simulated board: {0}")]
    Listener(#[from] ListenerError),

    /// The simulated board's registry could not be built.
    #[error("simulated board registry: {0}")]
    Registration(#[from] RegistrationError),

    /// A thread could not be spawned.
    #[error("failed to spawn thread '{name}': {source}")]
    Spawn {
        /// Thread name.
        name: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The simulated board's thread panicked.
    #[error("simulated board '{0}' panicked")]
    Panicked(String),

    /// Output could not be encoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;
