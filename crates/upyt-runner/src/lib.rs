//! upyt runner
//!
//! Command implementations for the `upyt` binary and a simulated board that
//! runs the device engine in-process.
//!
//! # Example
//!
//! ```rust,no_run
//! use upyt_host::LinkConfig;
//! use upyt_runner::sim::SimulatedBoard;
//! use upyt_wire::Args;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let board = SimulatedBoard::spawn("sim0")?;
//! let connection = board.connect(LinkConfig::default());
//! connection.open()?;
//! let reply = connection.call("ping", Args::new().kwarg("value", 10))?.recv()?;
//! assert_eq!(reply["value"], 11);
//! # Ok(())
//! # }
//! ```

pub mod commands;
mod error;
pub mod sim;

pub use error::*;
