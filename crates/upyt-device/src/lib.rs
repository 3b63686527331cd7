//! upyt device engine
//!
//! The device half of upyt: a registry of named instructions and remote
//! classes, a table of live remote instances, and a cooperative listener loop
//! that serves requests from a host one line at a time.
//!
//! # Architecture
//!
//! - [`Registry`] maps names to handlers. It is built once at startup through
//!   [`RegistryBuilder`] and is immutable afterwards.
//! - [`InstanceTable`] owns the objects created by remote construction
//!   requests and hands out ids that are never reused.
//! - [`Device`] owns both plus a [`ByteStream`] and runs the listener loop on
//!   a single-threaded tokio runtime.
//!
//! # Example
//!
//! ```rust,no_run
//! use upyt_device::{register_diagnostics, ChannelStream, Device, Registry, Reply};
//! use upyt_wire::Args;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut builder = Registry::builder();
//! register_diagnostics(&mut builder)?;
//! builder.register_instruction("add", |_, args: Args| {
//!     let a: i64 = args.require(0, "a")?;
//!     let b: i64 = args.require(1, "b")?;
//!     Ok(Reply::value(a + b))
//! })?;
//!
//! let (_host_tx, rx) = crossbeam_channel::unbounded();
//! let (tx, _host_rx) = crossbeam_channel::unbounded();
//! let mut device = Device::new(builder.build(), ChannelStream::new(rx, tx));
//! let exit = device.serve()?;
//! println!("listener ended: {:?}", exit);
//! # Ok(())
//! # }
//! ```

mod builtins;
mod error;
mod instances;
mod listener;
mod registry;
mod reply;
mod stream;

pub use builtins::{heartbeat, register_diagnostics, HEARTBEAT_PERIOD, HEARTBEAT_PULSE};
pub use error::*;
pub use instances::*;
pub use listener::*;
pub use registry::*;
pub use reply::*;
pub use stream::*;
