//! Wire protocol for simbus.
//!
//! This crate defines what travels between cores and brokers:
//!
//! - **Types** ([`ActionMessage`], [`Action`], [`RouteId`],
//!   [`ProtocolCommand`]): the message and its routing metadata.
//! - **Codec** ([`encode_body`], [`decode_body`]): the binary body layout.
//! - **Framing** ([`FrameHeader`], [`Deframer`],
//!   [`ActionMessage::packetize`]): how bodies are delimited on a stream.
//! - **Errors** ([`ProtocolError`]).
//!
//! # Architecture
//!
//! The protocol layer sits below the comms interface. It knows nothing
//! about sockets, routes, or threads, only how to turn a message into
//! bytes and back.
//!
//! ```text
//! Transport (bytes) → Protocol (ActionMessage) → Comms callback
//! ```

mod codec;
mod error;
pub mod frame;
mod types;

pub use codec::{MAX_NAME_LEN, MIN_BODY_SIZE, decode_body, encode_body};
pub use error::ProtocolError;
pub use frame::{
    DEFAULT_MAX_BODY_SIZE, Deframer, FRAME_HEADER_SIZE, FRAME_MAGIC,
    FRAME_TRAILER_SIZE, FRAME_VERSION, FrameHeader, MIN_FRAME_SIZE,
};
pub use types::{Action, ActionMessage, ProtocolCommand, RouteId};
