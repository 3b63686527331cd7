//! Line framing and line-level encoding.
//!
//! Every message is one line terminated by a single carriage return (`\r`,
//! never `\r\n`). A line is either the two-byte acknowledgement `ok` or a
//! compact JSON value.

use bytes::BytesMut;
use serde_json::Value;

use crate::error::{WireError, WireResult};
use crate::request::Request;

/// Line terminator byte.
pub const LINE_TERMINATOR: u8 = b'\r';

/// Acknowledgement payload, without terminator.
pub const ACK: &[u8] = b"ok";

/// Acknowledgement line, as written by a device.
pub const ACK_LINE: &[u8] = b"ok\r";

/// A decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// The `ok` acknowledgement.
    Ack,
    /// A response value (never `null`).
    Value(Value),
    /// The line is neither `ok` nor JSON. Devices only emit such lines after a
    /// fault, so the text is diagnostic output rather than protocol traffic.
    FramingFault(String),
}

/// Decode one line (terminator already stripped).
///
/// An undecodable line is not an error here: it is returned as
/// [`Frame::FramingFault`] so the caller can switch on it. Only the reserved
/// `null` value fails.
pub fn decode_line(line: &[u8]) -> WireResult<Frame> {
    if line == ACK {
        return Ok(Frame::Ack);
    }
    match serde_json::from_slice::<Value>(line) {
        Ok(Value::Null) => Err(WireError::ReservedValue {
            line: String::from_utf8_lossy(line).into_owned(),
        }),
        Ok(value) => Ok(Frame::Value(value)),
        Err(e) => {
            log::trace!("line is not JSON ({}): {:?}", e, String::from_utf8_lossy(line));
            Ok(Frame::FramingFault(
                String::from_utf8_lossy(line).trim_matches(&['\r', '\n'][..]).to_string(),
            ))
        }
    }
}

/// Encode a request as a terminated line.
pub fn encode_request(request: &Request) -> WireResult<Vec<u8>> {
    let mut line = serde_json::to_vec(request)?;
    line.push(LINE_TERMINATOR);
    Ok(line)
}

/// Encode a response value as a terminated line.
///
/// `null` is rejected: a call without a return value sends no response line.
pub fn encode_response(value: &Value) -> WireResult<Vec<u8>> {
    if value.is_null() {
        return Err(WireError::ReservedValue {
            line: "null".to_string(),
        });
    }
    let mut line = serde_json::to_vec(value)?;
    line.push(LINE_TERMINATOR);
    Ok(line)
}

/// Accumulates received bytes and splits them into lines.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: BytesMut,
}

impl LineFramer {
    /// Create an empty framer.
    pub fn new() -> Self {
        LineFramer {
            buffer: BytesMut::with_capacity(256),
        }
    }

    /// Add received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Take the next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let end = self.buffer.iter().position(|&b| b == LINE_TERMINATOR)?;
        let line = self.buffer.split_to(end);
        let _ = self.buffer.split_to(1);
        Some(line.to_vec())
    }

    /// Push bytes and drain every line they complete.
    pub fn push_lines(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.push(data);
        std::iter::from_fn(|| self.next_line()).collect()
    }

    /// Number of bytes of the incomplete trailing line.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Take the incomplete trailing line, leaving the framer empty.
    pub fn take_partial(&mut self) -> Vec<u8> {
        self.buffer.split().to_vec()
    }

    /// Discard any partial line.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
