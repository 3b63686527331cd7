//! The cooperative listener loop.
//!
//! The listener reads one byte at a time, accumulates a line until `\r`,
//! dispatches it, writes the response line (if any), then writes `ok`. When no
//! byte is available it sleeps briefly so other local tasks (heartbeats,
//! deferred handlers) can run.
//!
//! An interrupt byte (`0x03`) ends the loop at once, the way Ctrl-C drops a
//! board to its REPL.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use upyt_wire::{encode_response, Request, ACK_LINE, LINE_TERMINATOR};

use crate::error::{DeviceError, DeviceResult, ListenerError};
use crate::instances::InstanceTable;
use crate::registry::{Context, Registry};
use crate::reply::Reply;
use crate::stream::ByteStream;

/// Default sleep between empty reads.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Ctrl-C. Never appears inside a JSON line.
pub const INTERRUPT: u8 = 0x03;

const RUNNING: u8 = 0;
const BREAK: u8 = 1;
const RESET: u8 = 2;

/// Why the listener loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// `break_loop` or [`KeepAlive::stop`].
    Break,
    /// `machine_reset`: the board should restart its firmware.
    Reset,
    /// An interrupt byte arrived on the stream.
    Interrupted,
}

/// Shared flag that keeps the listener running. Clearing it ends the loop
/// after the current request.
#[derive(Debug, Clone)]
pub struct KeepAlive(Arc<AtomicU8>);

impl KeepAlive {
    /// A set flag.
    pub fn new() -> Self {
        KeepAlive(Arc::new(AtomicU8::new(RUNNING)))
    }

    /// True while the listener should keep going.
    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire) == RUNNING
    }

    /// Ask the listener to stop.
    pub fn stop(&self) {
        self.0.store(BREAK, Ordering::Release);
    }

    /// Ask the listener to stop so the board can restart.
    pub fn request_reset(&self) {
        self.0.store(RESET, Ordering::Release);
    }

    /// How the loop should report its end once the flag is cleared.
    pub fn exit(&self) -> Exit {
        match self.0.load(Ordering::Acquire) {
            RESET => Exit::Reset,
            _ => Exit::Break,
        }
    }
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the listener is in its request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Waiting for the first byte of a line.
    Idle,
    /// Accumulating a line.
    Reading,
    /// Running a handler.
    Dispatching,
    /// The acknowledgement for the last request has been written.
    AckSent,
    /// The loop has ended.
    Stopped,
}

/// A device: registry, live instances and the stream to the host.
pub struct Device<S> {
    stream: S,
    registry: Registry,
    instances: InstanceTable,
    keepalive: KeepAlive,
    state: ListenerState,
    started: Instant,
    line: Vec<u8>,
}

impl<S: ByteStream> Device<S> {
    /// Create a device listening on `stream`.
    pub fn new(registry: Registry, stream: S) -> Self {
        Device {
            stream,
            registry,
            instances: InstanceTable::new(),
            keepalive: KeepAlive::new(),
            state: ListenerState::Idle,
            started: Instant::now(),
            line: Vec::with_capacity(256),
        }
    }

    /// A handle to the keep-alive flag.
    pub fn keepalive(&self) -> KeepAlive {
        self.keepalive.clone()
    }

    /// Current listener state.
    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// The dispatch tables.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The live instances.
    pub fn instances(&self) -> &InstanceTable {
        &self.instances
    }

    /// Give back the stream.
    pub fn into_stream(self) -> S {
        self.stream
    }

    /// Serve requests until `break_loop`, `machine_reset`, an interrupt
    /// byte, a dispatch fault or a stream error.
    ///
    /// Local tasks spawned by handlers live in a `LocalSet` owned by this
    /// call and are dropped when it returns.
    pub async fn run(&mut self) -> Result<Exit, ListenerError> {
        let local = tokio::task::LocalSet::new();
        local.run_until(self.listen()).await
    }

    async fn listen(&mut self) -> Result<Exit, ListenerError> {
        log::info!("listener started");
        self.state = ListenerState::Idle;
        while self.keepalive.is_alive() {
            match self.stream.read_byte() {
                Ok(Some(INTERRUPT)) => {
                    log::info!("interrupted, dropping {} buffered bytes", self.line.len());
                    self.line.clear();
                    self.state = ListenerState::Stopped;
                    return Ok(Exit::Interrupted);
                }
                Ok(Some(LINE_TERMINATOR)) => {
                    let line = std::mem::take(&mut self.line);
                    self.process_line(&line).await?;
                }
                Ok(Some(byte)) => {
                    self.state = ListenerState::Reading;
                    self.line.push(byte);
                }
                Ok(None) => tokio::time::sleep(DEFAULT_POLL_INTERVAL).await,
                Err(e) => {
                    self.state = ListenerState::Stopped;
                    return Err(e.into());
                }
            }
        }
        self.state = ListenerState::Stopped;
        let exit = self.keepalive.exit();
        log::info!("listener stopped ({:?})", exit);
        Ok(exit)
    }

    /// Run on a fresh current-thread runtime, blocking the calling thread.
    pub fn serve(&mut self) -> Result<Exit, ListenerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        runtime.block_on(self.run())
    }

    async fn process_line(&mut self, line: &[u8]) -> Result<(), ListenerError> {
        let value: Value = match serde_json::from_slice(line) {
            Ok(value) => value,
            Err(e) => {
                log::debug!("ignoring undecodable line ({}): {:?}", e, String::from_utf8_lossy(line));
                self.state = ListenerState::Idle;
                return Ok(());
            }
        };

        self.state = ListenerState::Dispatching;
        match self.dispatch(value).await {
            Ok(response) => {
                if let Some(value) = response {
                    let encoded = encode_response(&value)?;
                    self.stream.write_all(&encoded)?;
                }
                self.stream.write_all(ACK_LINE)?;
                self.state = ListenerState::AckSent;
                Ok(())
            }
            Err(fault) => {
                log::error!("fault while handling {:?}: {}", String::from_utf8_lossy(line), fault);
                self.report_fault(&fault, line)?;
                self.state = ListenerState::Stopped;
                Err(ListenerError::Fault(fault))
            }
        }
    }

    async fn dispatch(&mut self, value: Value) -> DeviceResult<Option<Value>> {
        let Some(request) = Request::from_value(value)? else {
            log::debug!("ignoring unrecognised request shape");
            return Ok(None);
        };

        let reply = match request {
            Request::Method { id, name, args } => self.instances.invoke(id, &name, args)?,
            Request::Construct { class, args } => {
                let constructor = self
                    .registry
                    .resolve_class(&class)
                    .ok_or_else(|| DeviceError::UnknownClass(class.clone()))?;
                Reply::value(self.instances.create(&class, constructor, args)?)
            }
            Request::Instruction { name, args } => {
                let Some(handler) = self.registry.resolve_instruction(&name) else {
                    log::warn!("ignoring unknown instruction '{}'", name);
                    return Ok(None);
                };
                let mut ctx = Context {
                    registry: &self.registry,
                    instances: &mut self.instances,
                    keepalive: &self.keepalive,
                    started: self.started,
                };
                handler(&mut ctx, args)?
            }
        };
        reply.resolve().await
    }

    // Written in place of the acknowledgement. Neither line is JSON, which is
    // how the host tells a fault from a response.
    fn report_fault(&mut self, fault: &DeviceError, line: &[u8]) -> std::io::Result<()> {
        let report = format!(
            "fault: {}\rrequest: {}\r",
            single_line(&fault.to_string()),
            single_line(&String::from_utf8_lossy(line))
        );
        self.stream.write_all(report.as_bytes())
    }
}

fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}
