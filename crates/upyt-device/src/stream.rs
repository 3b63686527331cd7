//! Byte transport seen by the listener.

use std::io;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

/// A duplex byte stream with a non-blocking read side.
///
/// On hardware this is the USB virtual COM port; in tests and simulation it
/// is a pair of in-process channels.
pub trait ByteStream {
    /// Read one byte if one is available. Never blocks.
    fn read_byte(&mut self) -> io::Result<Option<u8>>;

    /// Write all bytes.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

/// [`ByteStream`] over a pair of byte channels.
#[derive(Debug, Clone)]
pub struct ChannelStream {
    rx: Receiver<u8>,
    tx: Sender<u8>,
}

impl ChannelStream {
    /// Wrap the device ends of two channels.
    pub fn new(rx: Receiver<u8>, tx: Sender<u8>) -> Self {
        ChannelStream { rx, tx }
    }
}

impl ByteStream for ChannelStream {
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        match self.rx.try_recv() {
            Ok(byte) => Ok(Some(byte)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "host side of the stream is closed",
            )),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        for &byte in data {
            self.tx.send(byte).map_err(|_| {
                io::Error::new(io::ErrorKind::BrokenPipe, "host side of the stream is closed")
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_channel_stream() {
        let (host_tx, device_rx) = unbounded();
        let (device_tx, host_rx) = unbounded();
        let mut stream = ChannelStream::new(device_rx, device_tx);

        assert_eq!(stream.read_byte().unwrap(), None);
        host_tx.send(b'x').unwrap();
        assert_eq!(stream.read_byte().unwrap(), Some(b'x'));

        stream.write_all(b"ok\r").unwrap();
        let written: Vec<u8> = host_rx.try_iter().collect();
        assert_eq!(written, b"ok\r");

        drop(host_tx);
        assert_eq!(
            stream.read_byte().unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }
}
