//! Byte links to a device: real serial ports and in-process loopbacks.

use std::io::{self, Read, Write};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serialport::{ClearBuffer, SerialPort};

use crate::config::LinkConfig;
use crate::error::LinkError;

/// An open, bidirectional byte link.
///
/// Reads block for at most the configured read timeout and then fail with
/// [`io::ErrorKind::TimedOut`], which the workers treat as "nothing yet".
pub trait SerialLink: Read + Write + Send {
    /// Human-readable link name, used in logs and metric labels.
    fn name(&self) -> &str;

    /// A second handle to the same link, for the other worker.
    fn try_clone_link(&self) -> Result<Box<dyn SerialLink>, LinkError>;

    /// Drop any bytes already received.
    fn clear_input(&mut self) -> Result<(), LinkError>;
}

/// Opens links. A connection keeps its opener so it can be reopened.
pub trait LinkOpener: Send + Sync {
    /// Name of the link this opener produces.
    fn name(&self) -> String;

    /// Open the link with the given settings.
    fn open(&self, config: &LinkConfig) -> Result<Box<dyn SerialLink>, LinkError>;
}

/// True for read errors that only mean "no data within the timeout".
pub fn is_empty_read(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

// ============================================================================
// Serial Port
// ============================================================================

/// Opens a named serial port (`/dev/ttyACM0`, `COM3`, ...).
#[derive(Debug, Clone)]
pub struct SerialPortOpener {
    path: String,
}

impl SerialPortOpener {
    /// Opener for the port at `path`.
    pub fn new(path: impl Into<String>) -> Self {
        SerialPortOpener { path: path.into() }
    }
}

impl LinkOpener for SerialPortOpener {
    fn name(&self) -> String {
        self.path.clone()
    }

    fn open(&self, config: &LinkConfig) -> Result<Box<dyn SerialLink>, LinkError> {
        let port = serialport::new(&self.path, config.baud_rate)
            .timeout(config.read_timeout())
            .open()?;
        tracing::info!("opened {} at {} baud", self.path, config.baud_rate);
        Ok(Box::new(SerialPortLink {
            name: self.path.clone(),
            port,
        }))
    }
}

/// [`SerialLink`] over a `serialport` handle.
pub struct SerialPortLink {
    name: String,
    port: Box<dyn SerialPort>,
}

impl Read for SerialPortLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialPortLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl SerialLink for SerialPortLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_clone_link(&self) -> Result<Box<dyn SerialLink>, LinkError> {
        Ok(Box::new(SerialPortLink {
            name: self.name.clone(),
            port: self.port.try_clone()?,
        }))
    }

    fn clear_input(&mut self) -> Result<(), LinkError> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

// ============================================================================
// Loopback
// ============================================================================

/// Create an in-process link: the host opener and the device's byte ends.
pub fn loopback(name: impl Into<String>) -> (LoopbackOpener, LoopbackPeer) {
    let (host_tx, device_rx) = crossbeam_channel::unbounded();
    let (device_tx, host_rx) = crossbeam_channel::unbounded();
    (
        LoopbackOpener {
            name: name.into(),
            tx: host_tx,
            rx: host_rx,
        },
        LoopbackPeer {
            rx: device_rx,
            tx: device_tx,
        },
    )
}

/// Host side of a loopback. Every `open` returns a handle onto the same
/// pair of byte queues, so the link survives close and reopen.
#[derive(Debug, Clone)]
pub struct LoopbackOpener {
    name: String,
    tx: Sender<u8>,
    rx: Receiver<u8>,
}

impl LinkOpener for LoopbackOpener {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn open(&self, config: &LinkConfig) -> Result<Box<dyn SerialLink>, LinkError> {
        Ok(Box::new(LoopbackLink {
            name: self.name.clone(),
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            timeout: config.read_timeout(),
        }))
    }
}

/// Device side of a loopback.
#[derive(Debug)]
pub struct LoopbackPeer {
    rx: Receiver<u8>,
    tx: Sender<u8>,
}

impl LoopbackPeer {
    /// Receiver of bytes written by the host and sender of bytes to it.
    pub fn into_parts(self) -> (Receiver<u8>, Sender<u8>) {
        (self.rx, self.tx)
    }
}

/// Open loopback handle.
#[derive(Debug)]
pub struct LoopbackLink {
    name: String,
    tx: Sender<u8>,
    rx: Receiver<u8>,
    timeout: Duration,
}

fn peer_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "device side of the loopback is closed")
}

impl Read for LoopbackLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let first = match self.rx.recv_timeout(self.timeout) {
            Ok(byte) => byte,
            Err(RecvTimeoutError::Timeout) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
            }
            Err(RecvTimeoutError::Disconnected) => return Err(peer_closed()),
        };
        buf[0] = first;
        let mut count = 1;
        while count < buf.len() {
            match self.rx.try_recv() {
                Ok(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                Err(_) => break,
            }
        }
        Ok(count)
    }
}

impl Write for LoopbackLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            self.tx.send(byte).map_err(|_| peer_closed())?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for LoopbackLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_clone_link(&self) -> Result<Box<dyn SerialLink>, LinkError> {
        Ok(Box::new(LoopbackLink {
            name: self.name.clone(),
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            timeout: self.timeout,
        }))
    }

    fn clear_input(&mut self) -> Result<(), LinkError> {
        let dropped = self.rx.try_iter().count();
        if dropped > 0 {
            tracing::debug!("{}: dropped {} stale bytes", self.name, dropped);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> LinkConfig {
        LinkConfig {
            read_timeout_ms: 10,
            ..LinkConfig::default()
        }
    }

    #[test]
    fn test_loopback_round_trip() {
        let (opener, peer) = loopback("sim");
        let (device_rx, device_tx) = peer.into_parts();
        let mut link = opener.open(&fast()).unwrap();

        link.write_all(b"{\"i\":\"x\"}\r").unwrap();
        let sent: Vec<u8> = device_rx.try_iter().collect();
        assert_eq!(sent, b"{\"i\":\"x\"}\r");

        for &b in b"ok\r" {
            device_tx.send(b).unwrap();
        }
        let mut buf = [0u8; 16];
        let n = link.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ok\r");
    }

    #[test]
    fn test_loopback_read_times_out() {
        let (opener, _peer) = loopback("sim");
        let mut link = opener.open(&fast()).unwrap();
        let mut buf = [0u8; 4];
        let err = link.read(&mut buf).unwrap_err();
        assert!(is_empty_read(&err));
    }

    #[test]
    fn test_loopback_clear_input() {
        let (opener, peer) = loopback("sim");
        let (_device_rx, device_tx) = peer.into_parts();
        let mut link = opener.open(&fast()).unwrap();
        device_tx.send(b'x').unwrap();
        link.clear_input().unwrap();
        let mut buf = [0u8; 4];
        assert!(link.read(&mut buf).is_err());
    }

    #[test]
    fn test_loopback_peer_closed() {
        let (opener, peer) = loopback("sim");
        let mut link = opener.open(&fast()).unwrap();
        drop(peer);
        let mut buf = [0u8; 4];
        assert_eq!(link.read(&mut buf).unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        assert!(link.write_all(b"x").is_err());
    }
}
