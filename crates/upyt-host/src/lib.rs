//! upyt host
//!
//! Talks to a board running the upyt listener over a serial link.
//!
//! # Architecture
//!
//! - [`Connection`] is the entry point: open it, call instructions by name,
//!   create remote objects, read responses.
//! - The transport runs two worker threads per open connection (see
//!   [`Channel`]): a transmitter that writes one request line at a time and
//!   a receiver that sorts incoming lines into acknowledgements, responses
//!   and remote faults.
//! - [`SerialLink`] abstracts the byte link, with a `serialport`
//!   implementation for hardware and a [`loopback`] for in-process devices.
//!
//! # Example
//!
//! ```rust,no_run
//! use upyt_host::{Connection, LinkConfig};
//! use upyt_wire::Args;
//!
//! # fn main() -> Result<(), upyt_host::HostError> {
//! let connection = Connection::serial("/dev/ttyACM0", LinkConfig::default());
//! connection.open()?;
//! let reply = connection.call("ping", Args::new().kwarg("value", 10))?.recv()?;
//! assert_eq!(reply["value"], 11);
//!
//! let pin = connection.instantiate("VirtualPin", Args::new().arg("X1"))?;
//! pin.call("value", Args::new().arg(true))?;
//! connection.close();
//! # Ok(())
//! # }
//! ```

mod calls;
mod config;
mod connection;
mod discovery;
mod engine;
mod error;
mod link;
mod remote;

pub use calls::*;
pub use config::*;
pub use connection::*;
pub use discovery::*;
pub use engine::{Channel, Pending};
pub use error::*;
pub use link::*;
pub use remote::*;
