//! The user-facing connection to one device.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};
use upyt_wire::{Args, Request};

use crate::calls::CallTable;
use crate::config::{LinkConfig, ProjectConfig};
use crate::discovery::find_port;
use crate::engine::{Channel, Pending, Workers};
use crate::error::{HostError, HostResult, LinkError, RemoteError};
use crate::link::{LinkOpener, SerialPortOpener};
use crate::remote::RemoteObject;

/// Ctrl-C into the MicroPython REPL, then a hard reset from there.
pub const HARD_RESET: &[u8] = b"\x03\r\nimport pyb\r\npyb.hard_reset()\r\n";

/// A connection to a device running the upyt listener.
///
/// All methods take `&self`; a connection can be shared between threads.
/// Dropping it closes it.
pub struct Connection {
    opener: Box<dyn LinkOpener>,
    channel: Arc<Channel>,
    workers: Mutex<Option<Workers>>,
    calls: RwLock<CallTable>,
}

impl Connection {
    /// A closed connection that will use `opener` for its link.
    pub fn new(opener: impl LinkOpener + 'static, config: LinkConfig) -> Self {
        let channel = Arc::new(Channel::new(opener.name(), config));
        Connection {
            opener: Box::new(opener),
            channel,
            workers: Mutex::new(None),
            calls: RwLock::new(CallTable::new()),
        }
    }

    /// A closed connection on the serial port at `path`.
    pub fn serial(path: impl Into<String>, config: LinkConfig) -> Self {
        Self::new(SerialPortOpener::new(path), config)
    }

    /// A closed connection to the board with this USB serial number.
    pub fn for_serial_number(serial: &str, config: LinkConfig) -> HostResult<Self> {
        let port = find_port(serial)?;
        Ok(Self::serial(port, config))
    }

    /// A closed connection to a device named in the project configuration.
    ///
    /// `config_path` overrides the `.upytester.yml` search.
    pub fn from_project(name: &str, config_path: Option<&Path>) -> HostResult<Self> {
        let (path, project) = ProjectConfig::discover(config_path)?;
        debug!("device '{}' from {}", name, path.display());
        let entry = project.device_entry(name)?;
        Self::for_serial_number(&entry.serial, project.link_for(name)?)
    }

    /// Link name.
    pub fn name(&self) -> &str {
        self.channel.name()
    }

    /// True between a successful [`open`](Self::open) and [`close`](Self::close).
    pub fn is_open(&self) -> bool {
        self.workers.lock().is_some()
    }

    /// Open the link, start the workers and discover the device's calls.
    /// Does nothing if already open.
    pub fn open(&self) -> HostResult<()> {
        {
            let mut workers = self.workers.lock();
            if workers.is_some() {
                return Ok(());
            }
            let mut link = self.opener.open(self.channel.config())?;
            link.clear_input()?;
            self.channel.reset();
            *workers = Some(self.channel.start(link)?);
        }
        info!("{}: connection open", self.name());

        if let Err(err) = self.discover() {
            warn!("{}: capability discovery failed: {}", self.name(), err);
            self.close();
            return Err(err);
        }

        if self.channel.config().heartbeat {
            if self.calls.read().has_instruction("heartbeat") {
                self.call("heartbeat", Args::new().kwarg("enabled", true))?;
            } else {
                warn!("{}: heartbeat requested but not offered by the device", self.name());
            }
        }
        Ok(())
    }

    fn discover(&self) -> HostResult<()> {
        let instructions = self.query_names("list_instructions")?;
        let classes = self.query_names("list_remote_classes")?;
        debug!(
            "{}: {} instructions, {} remote classes",
            self.name(),
            instructions.len(),
            classes.len()
        );
        *self.calls.write() = CallTable::from_discovery(instructions, classes);
        Ok(())
    }

    fn query_names(&self, instruction: &str) -> HostResult<Vec<String>> {
        let value = self
            .channel
            .send(&Request::instruction(instruction, Args::new()))?
            .recv()?;
        serde_json::from_value(value.clone()).map_err(|_| {
            HostError::UnexpectedResponse(format!("{} returned {}", instruction, value))
        })
    }

    /// Stop the workers and release the link. Queued lines are still written
    /// unless the device has faulted. Does nothing if already closed.
    pub fn close(&self) {
        let Some(workers) = self.workers.lock().take() else {
            return;
        };
        self.channel.request_halt();
        workers.join(self.name());
        *self.calls.write() = CallTable::new();
        info!("{}: connection closed", self.name());
    }

    /// Restart the device and leave the connection closed.
    ///
    /// A soft reset calls `machine_reset` through the listener, opening the
    /// connection first if needed. A hard reset closes the connection, breaks
    /// into the REPL on a fresh link and calls `pyb.hard_reset()`, so it also
    /// works when the listener no longer answers.
    pub fn reset(&self, hard: bool) -> HostResult<()> {
        if hard {
            self.close();
            let mut link = self.opener.open(self.channel.config())?;
            link.write_all(HARD_RESET).map_err(LinkError::from)?;
            link.flush().map_err(LinkError::from)?;
            info!("{}: hard reset sent", self.name());
        } else {
            self.open()?;
            let result = self.call("machine_reset", Args::new());
            self.close();
            result?;
            info!("{}: soft reset sent", self.name());
        }
        Ok(())
    }

    /// Stop both workers immediately, without waiting for queued lines.
    /// The connection stays nominally open until [`close`](Self::close).
    pub fn halt(&self) {
        self.channel.force_halt();
    }

    /// Snapshot of the discovered calls.
    pub fn calls(&self) -> CallTable {
        self.calls.read().clone()
    }

    /// Discovered instruction names, sorted.
    pub fn instructions(&self) -> Vec<String> {
        self.calls.read().instructions()
    }

    /// Discovered remote class names, sorted.
    pub fn remote_classes(&self) -> Vec<String> {
        self.calls.read().remote_classes()
    }

    /// Call a discovered instruction.
    pub fn call(&self, name: &str, args: Args) -> HostResult<Pending> {
        let request = self.calls.read().instruction_request(name, args)?;
        self.channel.send(&request)
    }

    /// A callable bound to a discovered instruction.
    pub fn instruction(&self, name: &str) -> HostResult<Instruction<'_>> {
        if !self.calls.read().has_instruction(name) {
            return Err(HostError::UnknownInstruction(name.to_string()));
        }
        Ok(Instruction {
            connection: self,
            name: name.to_string(),
        })
    }

    /// Create an instance of a discovered remote class.
    ///
    /// Reads the next response as the new instance id.
    pub fn instantiate(&self, class: &str, args: Args) -> HostResult<RemoteObject> {
        let request = self.calls.read().construct_request(class, args)?;
        let value = self.channel.send(&request)?.recv()?;
        let id = value.as_u64().ok_or_else(|| {
            HostError::UnexpectedResponse(format!("construction of {} returned {}", class, value))
        })?;
        debug!("{}: created {} #{}", self.name(), class, id);
        Ok(RemoteObject::new(class, id, Arc::clone(&self.channel)))
    }

    /// Send a request without consulting the call table.
    pub fn send(&self, request: &Request) -> HostResult<Pending> {
        self.channel.send(request)
    }

    /// Pop the next response; `Ok(None)` after `timeout`, which `None` makes
    /// unbounded.
    pub fn receive(&self, timeout: Option<Duration>) -> HostResult<Option<Value>> {
        self.channel.receive(timeout)
    }

    /// Iterate over responses until none arrives within `timeout` of the
    /// previous one.
    pub fn responses(&self, timeout: Duration) -> Responses<'_> {
        Responses {
            channel: &self.channel,
            timeout,
            done: false,
        }
    }

    /// Block until every queued line has been written and acknowledged.
    pub fn wait(&self) {
        self.channel.wait();
    }

    /// Switch between synchronous and asynchronous sending. Waits for the
    /// transmit queue to drain first.
    pub fn set_async_send(&self, enabled: bool) {
        self.channel.wait();
        self.channel.set_async(enabled);
        debug!(
            "{}: {} send mode",
            self.name(),
            if enabled { "asynchronous" } else { "synchronous" }
        );
    }

    /// True in asynchronous send mode.
    pub fn is_async_send(&self) -> bool {
        self.channel.is_async()
    }

    /// True once a halt has been requested or forced.
    pub fn is_halted(&self) -> bool {
        self.channel.is_halted()
    }

    /// Drain the faults the device reported since the last call.
    pub fn remote_faults(&self) -> Vec<RemoteError> {
        self.channel.remote_faults()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("channel", &self.channel)
            .field("open", &self.is_open())
            .finish()
    }
}

/// An instruction bound to a connection.
#[derive(Debug)]
pub struct Instruction<'c> {
    connection: &'c Connection,
    name: String,
}

impl Instruction<'_> {
    /// Instruction name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call the instruction.
    pub fn call(&self, args: Args) -> HostResult<Pending> {
        self.connection.call(&self.name, args)
    }
}

/// Iterator returned by [`Connection::responses`].
pub struct Responses<'c> {
    channel: &'c Channel,
    timeout: Duration,
    done: bool,
}

impl Iterator for Responses<'_> {
    type Item = HostResult<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.channel.receive(Some(self.timeout)) {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(HostError::Closing) => {
                self.done = true;
                None
            }
            Err(err) => Some(Err(err)),
        }
    }
}
