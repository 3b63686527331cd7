//! The host transport engine: two worker threads around four queues.
//!
//! ```text
//!  callers ──► transmit queue ──► [transmitter] ──► link ──► device
//!                                                              │
//!  callers ◄── response queue ◄─┐                              │
//!  send()  ◄── ack queue      ◄─┼── [receiver] ◄── link ◄──────┘
//!  callers ◄── fault queue    ◄─┘
//! ```
//!
//! In synchronous mode `send()` waits for the acknowledgement itself and the
//! transmitter only waits for `send()` to finish. In asynchronous mode the
//! transmitter consumes acknowledgements so that at most one request is
//! outstanding at the device at any time.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, trace, warn};
use upyt_metrics::{metric_defs, LinkLabels};
use upyt_wire::{decode_line, encode_request, Frame, LineFramer, Request, WireError};

use crate::config::LinkConfig;
use crate::error::{HostError, HostResult, RemoteError};
use crate::link::{is_empty_read, SerialLink};

/// Longest single blocking wait inside the engine, so halt requests are seen
/// promptly.
const POLL_SLICE: Duration = Duration::from_millis(10);

/// Receive buffer size.
const READ_CHUNK: usize = 256;

/// What the receiver puts on the ack queue.
#[derive(Debug)]
pub(crate) enum AckSignal {
    Ack,
    Fault(RemoteError),
}

/// Items on the response queue.
type ResponseItem = Result<Value, HostError>;

enum Flow {
    Continue,
    Stop,
}

// ============================================================================
// Channel
// ============================================================================

/// Queues and flags shared by callers and the two workers of one connection.
pub struct Channel {
    name: String,
    config: LinkConfig,
    labels: Vec<(&'static str, String)>,

    ack_tx: Sender<AckSignal>,
    ack_rx: Receiver<AckSignal>,
    response_tx: Sender<ResponseItem>,
    response_rx: Receiver<ResponseItem>,
    fault_tx: Sender<RemoteError>,
    fault_rx: Receiver<RemoteError>,
    transmit_tx: Sender<Vec<u8>>,
    transmit_rx: Receiver<Vec<u8>>,

    halt_transmit: AtomicBool,
    halt_receive: AtomicBool,
    idle: AtomicBool,
    async_send: AtomicBool,
    remote_fault: AtomicBool,
    in_flight: AtomicUsize,

    // One synchronous send at a time, whatever thread it comes from.
    send_lock: Mutex<()>,
}

impl Channel {
    /// Create the queues for a link called `name`.
    pub fn new(name: impl Into<String>, config: LinkConfig) -> Self {
        let name = name.into();
        let (ack_tx, ack_rx) = crossbeam_channel::unbounded();
        let (response_tx, response_rx) = crossbeam_channel::unbounded();
        let (fault_tx, fault_rx) = crossbeam_channel::unbounded();
        let (transmit_tx, transmit_rx) = crossbeam_channel::unbounded();
        Channel {
            labels: LinkLabels::new(name.clone()).to_labels(),
            name,
            config,
            ack_tx,
            ack_rx,
            response_tx,
            response_rx,
            fault_tx,
            fault_rx,
            transmit_tx,
            transmit_rx,
            // Halted until workers are started.
            halt_transmit: AtomicBool::new(true),
            halt_receive: AtomicBool::new(true),
            idle: AtomicBool::new(true),
            async_send: AtomicBool::new(false),
            remote_fault: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            send_lock: Mutex::new(()),
        }
    }

    /// Link name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Settings in effect.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Empty every queue and clear every flag, ready for a fresh link.
    pub(crate) fn reset(&self) {
        let stale = self.ack_rx.try_iter().count()
            + self.response_rx.try_iter().count()
            + self.fault_rx.try_iter().count()
            + self.transmit_rx.try_iter().count();
        if stale > 0 {
            debug!("{}: discarded {} stale queue entries", self.name, stale);
        }
        self.in_flight.store(0, Ordering::SeqCst);
        self.idle.store(true, Ordering::SeqCst);
        self.async_send.store(false, Ordering::SeqCst);
        self.remote_fault.store(false, Ordering::SeqCst);
        self.halt_receive.store(false, Ordering::SeqCst);
        self.halt_transmit.store(false, Ordering::SeqCst);
    }

    /// Ask the transmitter to finish the queued lines and stop. The
    /// transmitter then stops the receiver.
    pub(crate) fn request_halt(&self) {
        self.halt_transmit.store(true, Ordering::SeqCst);
    }

    /// Stop both workers now.
    pub(crate) fn force_halt(&self) {
        self.halt_transmit.store(true, Ordering::SeqCst);
        self.halt_receive.store(true, Ordering::SeqCst);
    }

    /// True once a halt has been requested or forced.
    pub fn is_halted(&self) -> bool {
        self.halt_transmit.load(Ordering::SeqCst)
    }

    /// True once the device has reported a fault on this link.
    pub fn has_remote_fault(&self) -> bool {
        self.remote_fault.load(Ordering::SeqCst)
    }

    /// True in asynchronous send mode.
    pub fn is_async(&self) -> bool {
        self.async_send.load(Ordering::SeqCst)
    }

    pub(crate) fn set_async(&self, enabled: bool) {
        self.async_send.store(enabled, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------------
    // Caller side
    // ------------------------------------------------------------------------

    /// Queue a request.
    ///
    /// In synchronous mode this blocks until the device acknowledges the line
    /// (or reports a fault, or the response timeout passes). In asynchronous
    /// mode it returns as soon as the line is queued.
    pub fn send(self: &Arc<Self>, request: &Request) -> HostResult<Pending> {
        let line = encode_request(request)?;
        if self.is_async() {
            self.enqueue(line)?;
        } else {
            let _guard = self.send_lock.lock();
            self.take_stale_fault()?;
            self.enqueue(line)?;
            let result = self.await_ack();
            self.idle.store(true, Ordering::SeqCst);
            result?;
        }
        Ok(Pending {
            channel: Arc::clone(self),
        })
    }

    // Acknowledgements left over from timed-out sends are discarded; a
    // fault among them is reported instead of sending.
    fn take_stale_fault(&self) -> HostResult<()> {
        for signal in self.ack_rx.try_iter() {
            match signal {
                AckSignal::Ack => trace!("{}: discarding late acknowledgement", self.name),
                AckSignal::Fault(fault) => return Err(HostError::Remote(fault)),
            }
        }
        Ok(())
    }

    fn enqueue(&self, line: Vec<u8>) -> HostResult<()> {
        if self.is_halted() {
            return Err(HostError::Closing);
        }
        let backlog = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        if self.transmit_tx.send(line).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(HostError::Closing);
        }
        metrics::gauge!(metric_defs::TRANSMIT_BACKLOG.name, &self.labels).set(backlog as f64);
        Ok(())
    }

    fn await_ack(&self) -> HostResult<()> {
        let timeout = self.config.response_timeout();
        let started = Instant::now();
        match self.ack_rx.recv_timeout(timeout) {
            Ok(AckSignal::Ack) => {
                metrics::histogram!(metric_defs::ACK_LATENCY.name, &self.labels)
                    .record(started.elapsed().as_micros() as f64);
                Ok(())
            }
            Ok(AckSignal::Fault(fault)) => {
                self.force_halt();
                Err(HostError::Remote(fault))
            }
            Err(_) => {
                warn!("{}: no acknowledgement within {:?}", self.name, timeout);
                metrics::counter!(metric_defs::ACK_TIMEOUTS.name, &self.labels).increment(1);
                Err(HostError::AckTimeout(timeout))
            }
        }
    }

    /// Pop one response. `Ok(None)` when `timeout` passes first; `None` waits
    /// indefinitely. Fails with [`HostError::Closing`] once the channel is
    /// halted and no response is left.
    pub fn receive(&self, timeout: Option<Duration>) -> HostResult<Option<Value>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let slice = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(POLL_SLICE),
                None => POLL_SLICE,
            };
            match self.response_rx.recv_timeout(slice) {
                Ok(Ok(value)) => return Ok(Some(value)),
                Ok(Err(err)) => {
                    if matches!(err, HostError::Remote(_)) {
                        self.force_halt();
                    }
                    return Err(err);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.is_halted() && self.response_rx.is_empty() {
                        return Err(HostError::Closing);
                    }
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Ok(None);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(HostError::Closing),
            }
        }
    }

    /// Block until every queued line has been written and acknowledged, or
    /// the channel halts.
    pub fn wait(&self) {
        let poll = self.config.idle_poll();
        while self.in_flight.load(Ordering::SeqCst) > 0 && !self.is_halted() {
            thread::sleep(poll);
        }
    }

    /// Drain the remote-fault queue.
    pub fn remote_faults(&self) -> Vec<RemoteError> {
        self.fault_rx.try_iter().collect()
    }

    // ------------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------------

    /// Start both workers on `link`.
    pub(crate) fn start(self: &Arc<Self>, link: Box<dyn SerialLink>) -> HostResult<Workers> {
        let rx_link = link.try_clone_link()?;

        let channel = Arc::clone(self);
        let receiver = thread::Builder::new()
            .name(format!("upyt-rx-{}", self.name))
            .spawn(move || channel.receive_loop(rx_link))
            .map_err(|source| HostError::Worker {
                name: "receiver",
                source,
            })?;

        let channel = Arc::clone(self);
        let transmitter = match thread::Builder::new()
            .name(format!("upyt-tx-{}", self.name))
            .spawn(move || channel.transmit_loop(link))
        {
            Ok(handle) => handle,
            Err(source) => {
                self.force_halt();
                let _ = receiver.join();
                return Err(HostError::Worker {
                    name: "transmitter",
                    source,
                });
            }
        };

        Ok(Workers {
            transmitter,
            receiver,
        })
    }

    fn transmit_loop(&self, mut link: Box<dyn SerialLink>) {
        debug!("{}: transmitter started", self.name);
        let queue_poll = self.config.write_timeout().min(POLL_SLICE).max(Duration::from_millis(1));
        loop {
            let line = match self.transmit_rx.recv_timeout(queue_poll) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => {
                    if self.is_halted() {
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            if self.has_remote_fault() || self.halt_receive.load(Ordering::SeqCst) {
                let discarded = 1 + self.transmit_rx.try_iter().count();
                warn!(
                    "{}: discarding {} queued line(s) after forced halt",
                    self.name, discarded
                );
                self.in_flight.fetch_sub(discarded, Ordering::SeqCst);
                break;
            }

            self.idle.store(false, Ordering::SeqCst);
            let sent_at = Instant::now();
            if let Err(err) = link.write_all(&line).and_then(|_| link.flush()) {
                error!("{}: write failed: {}", self.name, err);
                let _ = self.response_tx.send(Err(HostError::Link(err.into())));
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.force_halt();
                break;
            }
            debug!("{} --> {}", self.name, String::from_utf8_lossy(trim_terminator(&line)));
            metrics::counter!(metric_defs::LINES_SENT.name, &self.labels).increment(1);
            metrics::counter!(metric_defs::BYTES_SENT.name, &self.labels).increment(line.len() as u64);

            let flow = if self.is_async() {
                self.await_async_ack(sent_at)
            } else {
                self.await_idle(sent_at)
            };
            self.idle.store(true, Ordering::SeqCst);
            let backlog = self.in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
            metrics::gauge!(metric_defs::TRANSMIT_BACKLOG.name, &self.labels).set(backlog as f64);
            if let Flow::Stop = flow {
                break;
            }
        }

        let leftover = self.transmit_rx.try_iter().count();
        if leftover > 0 {
            warn!("{}: discarding {} unsent line(s)", self.name, leftover);
            self.in_flight.fetch_sub(leftover, Ordering::SeqCst);
        }
        self.halt_receive.store(true, Ordering::SeqCst);
        debug!("{}: transmitter stopped", self.name);
    }

    // Asynchronous mode: the transmitter owns the ack queue.
    fn await_async_ack(&self, sent_at: Instant) -> Flow {
        let timeout = self.config.response_timeout();
        let deadline = sent_at + timeout;
        loop {
            if self.has_remote_fault() {
                return Flow::Stop;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("{}: no acknowledgement within {:?}", self.name, timeout);
                metrics::counter!(metric_defs::ACK_TIMEOUTS.name, &self.labels).increment(1);
                let _ = self.response_tx.send(Err(HostError::AckTimeout(timeout)));
                return Flow::Continue;
            }
            match self.ack_rx.recv_timeout(remaining.min(POLL_SLICE)) {
                Ok(AckSignal::Ack) => {
                    metrics::histogram!(metric_defs::ACK_LATENCY.name, &self.labels)
                        .record(sent_at.elapsed().as_micros() as f64);
                    return Flow::Continue;
                }
                Ok(AckSignal::Fault(_)) => return Flow::Stop,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Flow::Stop,
            }
        }
    }

    // Synchronous mode: send() owns the ack queue and raises `idle` when done.
    fn await_idle(&self, sent_at: Instant) -> Flow {
        let deadline = sent_at + self.config.response_timeout() + POLL_SLICE;
        let poll = self.config.idle_poll();
        while !self.idle.load(Ordering::SeqCst) {
            if self.halt_receive.load(Ordering::SeqCst) || Instant::now() >= deadline {
                break;
            }
            thread::sleep(poll);
        }
        Flow::Continue
    }

    fn receive_loop(&self, mut link: Box<dyn SerialLink>) {
        debug!("{}: receiver started", self.name);
        let mut framer = LineFramer::new();
        let mut buf = [0u8; READ_CHUNK];
        while !self.halt_receive.load(Ordering::SeqCst) {
            match link.read(&mut buf) {
                Ok(0) => thread::sleep(self.config.idle_poll()),
                Ok(n) => {
                    framer.push(&buf[..n]);
                    while let Some(line) = framer.next_line() {
                        if let Some(first) = self.handle_line(&line) {
                            self.collect_fault(first, &mut framer, link.as_mut());
                            debug!("{}: receiver stopped after remote fault", self.name);
                            return;
                        }
                    }
                }
                Err(err) if is_empty_read(&err) => {}
                Err(err) => {
                    error!("{}: read failed: {}", self.name, err);
                    let _ = self.response_tx.send(Err(HostError::Link(err.into())));
                    self.force_halt();
                    break;
                }
            }
        }
        debug!("{}: receiver stopped", self.name);
    }

    // Returns the line text when it is not protocol traffic.
    fn handle_line(&self, line: &[u8]) -> Option<String> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        metrics::counter!(metric_defs::LINES_RECEIVED.name, &self.labels).increment(1);
        match decode_line(line) {
            Ok(Frame::Ack) => {
                trace!("{} <-- ok", self.name);
                metrics::counter!(metric_defs::ACKS.name, &self.labels).increment(1);
                let _ = self.ack_tx.send(AckSignal::Ack);
                None
            }
            Ok(Frame::Value(value)) => {
                debug!("{} <-- {}", self.name, value);
                metrics::counter!(metric_defs::RESPONSES.name, &self.labels).increment(1);
                let _ = self.response_tx.send(Ok(value));
                None
            }
            Ok(Frame::FramingFault(text)) => Some(text),
            Err(WireError::ReservedValue { line }) => {
                warn!("{}: device sent reserved null in {:?}", self.name, line);
                let _ = self.response_tx.send(Err(HostError::ReservedValue(line)));
                None
            }
            Err(err) => {
                let _ = self.response_tx.send(Err(err.into()));
                None
            }
        }
    }

    // Everything the device prints after a fault belongs to the same report;
    // keep reading until the link goes quiet.
    fn collect_fault(&self, first: String, framer: &mut LineFramer, link: &mut dyn SerialLink) {
        self.remote_fault.store(true, Ordering::SeqCst);

        let mut lines = vec![first];
        let mut buf = [0u8; READ_CHUNK];
        loop {
            lines.extend(std::iter::from_fn(|| framer.next_line()).map(lossy_line));
            match link.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => framer.push(&buf[..n]),
                Err(err) if is_empty_read(&err) => break,
                // Devices may drop the link once the report is out.
                Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => break,
                Err(err) => {
                    warn!("{}: read failed while collecting fault: {}", self.name, err);
                    break;
                }
            }
        }
        lines.push(lossy_line(framer.take_partial()));
        lines.retain(|line| !line.trim().is_empty());

        for line in &lines {
            error!("{} remote: {}", self.name, line);
        }
        metrics::counter!(metric_defs::REMOTE_FAULTS.name, &self.labels).increment(1);

        // Queued before the halt: a reader must never find the channel
        // halted with the fault still missing. Takers halt as well.
        let fault = RemoteError::new(lines);
        let _ = self.fault_tx.send(fault.clone());
        if !self.is_async() && !self.idle.load(Ordering::SeqCst) {
            let _ = self.ack_tx.send(AckSignal::Fault(fault));
        } else {
            let _ = self.response_tx.send(Err(HostError::Remote(fault)));
        }
        self.force_halt();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("halted", &self.is_halted())
            .field("async", &self.is_async())
            .field("remote_fault", &self.has_remote_fault())
            .finish()
    }
}

fn trim_terminator(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn lossy_line(line: Vec<u8>) -> String {
    String::from_utf8_lossy(&line)
        .trim_matches(&['\r', '\n'][..])
        .to_string()
}

/// Join handles of a running connection's workers.
pub(crate) struct Workers {
    transmitter: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

impl Workers {
    /// Wait for both workers, transmitter first.
    pub(crate) fn join(self, name: &str) {
        if self.transmitter.join().is_err() {
            error!("{}: transmitter panicked", name);
        }
        if self.receiver.join().is_err() {
            error!("{}: receiver panicked", name);
        }
    }
}

// ============================================================================
// Pending
// ============================================================================

/// Handle to the response of a sent request.
///
/// Responses are not matched to requests; `recv` pops the next one in
/// arrival order, which for synchronous sends is this request's response.
#[derive(Debug)]
pub struct Pending {
    channel: Arc<Channel>,
}

impl Pending {
    /// Wait for the response, up to the configured response timeout.
    pub fn recv(self) -> HostResult<Value> {
        let timeout = self.channel.config.response_timeout();
        self.recv_timeout(timeout)
    }

    /// Wait for the response, up to `timeout`.
    pub fn recv_timeout(self, timeout: Duration) -> HostResult<Value> {
        self.channel
            .receive(Some(timeout))?
            .ok_or(HostError::ResponseTimeout(timeout))
    }

    /// Take the response if it has already arrived. In synchronous mode a
    /// call's response always precedes its acknowledgement, so `Ok(None)`
    /// means the call returned nothing.
    pub fn try_recv(self) -> HostResult<Option<Value>> {
        self.channel.receive(Some(Duration::ZERO))
    }
}
