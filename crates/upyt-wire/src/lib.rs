//! upyt wire protocol
//!
//! This crate defines the line protocol spoken between a host and a board
//! running the upyt listener. It is shared by both sides.
//!
//! # Protocol Overview
//!
//! - **Requests** (host → device): compact JSON objects, one per line
//! - **Acknowledgements** (device → host): the literal `ok`, sent after every
//!   request line has been fully processed
//! - **Responses** (device → host): any JSON value except `null`, sent before
//!   the acknowledgement of the request that produced it
//!
//! Lines end with a single `\r`. Request shapes are described in
//! [`Request`]; remote objects are referenced as `{"cls": ..., "idx": ...}`
//! (see [`ObjectRef`]).
//!
//! # Example
//!
//! ```rust
//! use upyt_wire::{decode_line, encode_request, Args, Frame, Request};
//!
//! let line = encode_request(&Request::instruction("ping", Args::new().kwarg("value", 10))).unwrap();
//! assert_eq!(line, b"{\"i\":\"ping\",\"k\":{\"value\":10}}\r");
//!
//! assert_eq!(decode_line(b"ok").unwrap(), Frame::Ack);
//! ```

mod codec;
mod error;
mod request;

pub use codec::*;
pub use error::*;
pub use request::*;

pub use serde_json::{json, Map, Value};
