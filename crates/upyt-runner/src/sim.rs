//! A simulated board: the device engine on a thread, wired to the host over
//! an in-process loopback link.
//!
//! The board offers the diagnostic instructions, `delay_ms`, `heartbeat` and
//! a `VirtualPin` remote class, which is enough to drive every part of the
//! protocol without hardware. It also reboots: `machine_reset` restarts the
//! listener with a fresh registry, and an interrupt byte drops it to a stand-in
//! REPL that only understands `pyb.hard_reset()`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace, warn};
use upyt_device::{
    heartbeat, register_diagnostics, ByteStream, ChannelStream, Device, DeviceError,
    DeviceResult, Exit, InstanceTable, ListenerError, Registry, RegistrationError, RemoteObject,
    Reply,
};
use upyt_host::{loopback, Connection, LinkConfig, LoopbackOpener};
use upyt_wire::{Args, ObjectRef, WireError};

use crate::error::{RunnerError, RunnerResult};

/// Remote class name of [`VirtualPin`].
pub const VIRTUAL_PIN: &str = "VirtualPin";

/// Sleep between empty reads at the REPL.
const REPL_POLL: Duration = Duration::from_millis(1);

// ============================================================================
// BoardLed
// ============================================================================

/// The heartbeat LED. Clones share the same LED, so tests can watch it from
/// outside the board thread.
#[derive(Debug, Clone, Default)]
pub struct BoardLed {
    lit: Arc<AtomicBool>,
    pulses: Arc<AtomicUsize>,
}

impl BoardLed {
    fn set(&self, on: bool) {
        if on && !self.lit.swap(true, Ordering::SeqCst) {
            self.pulses.fetch_add(1, Ordering::SeqCst);
        } else if !on {
            self.lit.store(false, Ordering::SeqCst);
        }
        trace!("heartbeat led {}", if on { "on" } else { "off" });
    }

    /// True while the LED is on.
    pub fn is_lit(&self) -> bool {
        self.lit.load(Ordering::SeqCst)
    }

    /// How many times the LED has been switched on.
    pub fn pulses(&self) -> usize {
        self.pulses.load(Ordering::SeqCst)
    }
}

// ============================================================================
// VirtualPin
// ============================================================================

/// A digital pin with no hardware behind it.
///
/// Methods: `value([level])`, `on()`, `off()`, `toggle()`, `name()` and
/// `follow(pin)`. A pin that follows another is driven whenever the other one
/// changes level.
#[derive(Debug)]
pub struct VirtualPin {
    name: String,
    level: bool,
    followers: Vec<ObjectRef>,
}

impl VirtualPin {
    /// Constructor arguments: `name`, optional initial `value`.
    pub fn construct(args: Args, _: &InstanceTable) -> DeviceResult<Self> {
        let name: String = args.require(0, "name")?;
        let level: bool = args.get_or(1, "value", false)?;
        debug!("VirtualPin {} created at level {}", name, level);
        Ok(VirtualPin {
            name,
            level,
            followers: Vec::new(),
        })
    }

    fn drive(&mut self, level: bool, peers: &InstanceTable) -> DeviceResult<Reply> {
        self.level = level;
        trace!("VirtualPin {} -> {}", self.name, level);
        for follower in &self.followers {
            peers.invoke_ref(follower, "value", Args::new().arg(level))?;
        }
        Ok(Reply::none())
    }
}

impl RemoteObject for VirtualPin {
    fn invoke(&mut self, method: &str, args: Args, peers: &InstanceTable) -> DeviceResult<Reply> {
        match method {
            "value" => match args.get::<bool>(0, "value")? {
                Some(level) => self.drive(level, peers),
                None => Ok(Reply::value(self.level)),
            },
            "on" => self.drive(true, peers),
            "off" => self.drive(false, peers),
            "toggle" => self.drive(!self.level, peers),
            "name" => Ok(Reply::value(self.name.clone())),
            "follow" => {
                let raw: serde_json::Value = args.require(0, "pin")?;
                let target = ObjectRef::from_value(&raw).ok_or_else(|| WireError::InvalidArgument {
                    name: "pin".to_string(),
                    reason: format!("expected an object reference, got {}", raw),
                })?;
                if target.cls != VIRTUAL_PIN {
                    return Err(WireError::InvalidArgument {
                        name: "pin".to_string(),
                        reason: format!("cannot follow a '{}'", target.cls),
                    }
                    .into());
                }
                // Resolving up front rejects ids that do not exist.
                peers.resolve(&target)?;
                // Mirror the current level so the follower starts in sync.
                peers.invoke_ref(&target, "value", Args::new().arg(self.level))?;
                self.followers.push(target);
                Ok(Reply::none())
            }
            other => Err(DeviceError::NotCallable {
                class: VIRTUAL_PIN.to_string(),
                method: other.to_string(),
            }),
        }
    }

    fn teardown(&mut self) {
        debug!("VirtualPin {} released", self.name);
        self.followers.clear();
    }
}

// ============================================================================
// Registry
// ============================================================================

/// The simulated board's registry, with `heartbeat` driving `led`.
pub fn simulated_registry(led: &BoardLed) -> Result<Registry, RegistrationError> {
    let led = led.clone();
    let mut builder = Registry::builder();
    register_diagnostics(&mut builder)?;
    builder
        .register_instruction("delay_ms", |_, args: Args| {
            let ms: u64 = args.require(0, "ms")?;
            Ok(Reply::deferred(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(None)
            }))
        })?
        .register_instruction("heartbeat", heartbeat(move |on| led.set(on)))?
        .register_remote_class(VIRTUAL_PIN, VirtualPin::construct)?;
    Ok(builder.build())
}

// ============================================================================
// SimulatedBoard
// ============================================================================

/// A running simulated board.
///
/// The board thread runs until `break_loop`, a fault, or until every host
/// handle onto the loopback is gone. Resets restart the listener on the same
/// thread.
#[derive(Debug)]
pub struct SimulatedBoard {
    name: String,
    opener: LoopbackOpener,
    led: BoardLed,
    boots: Arc<AtomicUsize>,
    thread: JoinHandle<RunnerResult<()>>,
}

impl SimulatedBoard {
    /// Start a board named `name` on its own thread.
    pub fn spawn(name: &str) -> RunnerResult<Self> {
        let (opener, peer) = loopback(name);
        let (rx, tx) = peer.into_parts();
        let led = BoardLed::default();
        let boots = Arc::new(AtomicUsize::new(0));
        let thread_name = format!("upyt-sim-{}", name);
        let board_name = name.to_string();
        let board_led = led.clone();
        let board_boots = Arc::clone(&boots);
        let thread = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                boot_loop(&board_name, ChannelStream::new(rx, tx), &board_led, &board_boots)
            })
            .map_err(|source| RunnerError::Spawn {
                name: thread_name,
                source,
            })?;
        Ok(SimulatedBoard {
            name: name.to_string(),
            opener,
            led,
            boots,
            thread,
        })
    }

    /// The board's heartbeat LED.
    pub fn led(&self) -> BoardLed {
        self.led.clone()
    }

    /// How many times the listener has started, counting the first boot.
    pub fn boots(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }

    /// Board name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// An opener onto the board's loopback link.
    pub fn opener(&self) -> LoopbackOpener {
        self.opener.clone()
    }

    /// A closed connection to the board.
    pub fn connect(&self, config: LinkConfig) -> Connection {
        Connection::new(self.opener(), config)
    }

    /// True while the listener thread is alive.
    pub fn is_running(&self) -> bool {
        !self.thread.is_finished()
    }

    /// Wait for the listener to end and return how it ended.
    ///
    /// Every connection made from this board must be dropped first, or the
    /// listener must already have stopped, otherwise this blocks.
    pub fn join(self) -> RunnerResult<()> {
        let SimulatedBoard {
            name,
            opener,
            thread,
            ..
        } = self;
        drop(opener);
        thread.join().map_err(|_| RunnerError::Panicked(name))?
    }
}

fn boot_loop(
    name: &str,
    mut stream: ChannelStream,
    led: &BoardLed,
    boots: &AtomicUsize,
) -> RunnerResult<()> {
    loop {
        // Handlers are not Send, so the registry is built on this thread.
        let registry = simulated_registry(led)?;
        let mut device = Device::new(registry, stream.clone());
        let boot = boots.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("{}: boot {}", name, boot);
        let exit = device.serve();
        led.set(false);
        match exit {
            Ok(Exit::Break) => {
                info!("{}: listener exited", name);
                return Ok(());
            }
            Ok(Exit::Reset) => info!("{}: soft reset", name),
            Ok(Exit::Interrupted) => {
                info!("{}: interrupted, at the REPL", name);
                repl(name, &mut stream)?;
                info!("{}: hard reset", name);
            }
            Err(e) => {
                warn!("{}: listener stopped: {}", name, e);
                return Err(e.into());
            }
        }
    }
}

// Swallows REPL input line by line until a line calls `hard_reset()`.
fn repl(name: &str, stream: &mut ChannelStream) -> RunnerResult<()> {
    let mut line = Vec::new();
    loop {
        match stream.read_byte() {
            Ok(Some(b'\n')) => {
                let text = String::from_utf8_lossy(&line).trim().to_string();
                line.clear();
                if text.is_empty() {
                    continue;
                }
                debug!("{}: repl >>> {}", name, text);
                if text.ends_with("hard_reset()") {
                    return Ok(());
                }
            }
            Ok(Some(byte)) => line.push(byte),
            Ok(None) => thread::sleep(REPL_POLL),
            Err(e) => return Err(ListenerError::from(e).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_contents() {
        let registry = simulated_registry(&BoardLed::default()).unwrap();
        assert_eq!(
            registry.instruction_names(),
            vec![
                "break_loop",
                "clean_remote_classes",
                "delay_ms",
                "get_system_info",
                "get_ticks_ms",
                "heartbeat",
                "list_instructions",
                "list_remote_classes",
                "machine_reset",
                "ping",
            ]
        );
        assert_eq!(registry.class_names(), vec![VIRTUAL_PIN]);
    }

    fn pin(table: &mut InstanceTable, registry: &Registry, name: &str) -> u64 {
        let constructor = registry.resolve_class(VIRTUAL_PIN).unwrap();
        table
            .create(VIRTUAL_PIN, constructor, Args::new().arg(name))
            .unwrap()
    }

    fn ready(reply: Reply) -> Option<serde_json::Value> {
        match reply {
            Reply::Ready(value) => value,
            Reply::Deferred(_) => panic!("pin methods complete immediately"),
        }
    }

    #[test]
    fn test_virtual_pin_levels() {
        let registry = simulated_registry(&BoardLed::default()).unwrap();
        let mut table = InstanceTable::new();
        let id = pin(&mut table, &registry, "X1");

        assert_eq!(ready(table.invoke(id, "value", Args::new()).unwrap()), Some(json!(false)));
        assert_eq!(ready(table.invoke(id, "on", Args::new()).unwrap()), None);
        assert_eq!(ready(table.invoke(id, "value", Args::new()).unwrap()), Some(json!(true)));
        table.invoke(id, "toggle", Args::new()).unwrap();
        assert_eq!(ready(table.invoke(id, "value", Args::new()).unwrap()), Some(json!(false)));
        assert_eq!(ready(table.invoke(id, "name", Args::new()).unwrap()), Some(json!("X1")));
        assert!(matches!(
            table.invoke(id, "explode", Args::new()),
            Err(DeviceError::NotCallable { .. })
        ));
    }

    #[test]
    fn test_virtual_pin_follow() {
        let registry = simulated_registry(&BoardLed::default()).unwrap();
        let mut table = InstanceTable::new();
        let led = pin(&mut table, &registry, "LED");
        let button = pin(&mut table, &registry, "BTN");

        let target = Args::new().arg(ObjectRef::new(VIRTUAL_PIN, led));
        table.invoke(button, "follow", target).unwrap();
        table.invoke(button, "on", Args::new()).unwrap();
        assert_eq!(ready(table.invoke(led, "value", Args::new()).unwrap()), Some(json!(true)));

        let missing = Args::new().arg(ObjectRef::new(VIRTUAL_PIN, 99));
        assert!(matches!(
            table.invoke(button, "follow", missing),
            Err(DeviceError::UnknownInstance(99))
        ));
        // A pin cannot follow itself: it is busy while its method runs.
        let own = Args::new().arg(ObjectRef::new(VIRTUAL_PIN, button));
        assert!(matches!(
            table.invoke(button, "follow", own),
            Err(DeviceError::InstanceBusy(_))
        ));
    }

    #[test]
    fn test_led_counts_rising_edges() {
        let led = BoardLed::default();
        led.set(true);
        led.set(true);
        assert!(led.is_lit());
        led.set(false);
        led.set(true);
        assert_eq!(led.pulses(), 2);
    }

    #[test]
    fn test_repl_waits_for_hard_reset() {
        let (host_tx, device_rx) = crossbeam_channel::unbounded();
        let (device_tx, _host_rx) = crossbeam_channel::unbounded();
        let mut stream = ChannelStream::new(device_rx, device_tx);
        for &b in b"\r\nimport pyb\r\npyb.hard_reset()\r\n{" {
            host_tx.send(b).unwrap();
        }
        repl("sim", &mut stream).unwrap();
        // Bytes after the reset line are left for the next listener.
        assert_eq!(stream.read_byte().unwrap(), Some(b'{'));

        drop(host_tx);
        assert!(matches!(
            repl("sim", &mut stream),
            Err(RunnerError::Listener(ListenerError::Io(_)))
        ));
    }

    #[test]
    fn test_virtual_pin_requires_name() {
        let registry = simulated_registry(&BoardLed::default()).unwrap();
        let constructor = registry.resolve_class(VIRTUAL_PIN).unwrap();
        let mut table = InstanceTable::new();
        assert!(table.create(VIRTUAL_PIN, constructor, Args::new()).is_err());
        assert_eq!(table.next_id(), 0);
    }
}
