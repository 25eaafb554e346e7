//! # Wire Codec
//!
//! Framing for peer connections. A freshly dialed connection starts with a
//! null-terminated handshake (see [`Connection`]); after the handshake both
//! sides exchange self-describing, newline-delimited JSON objects: either a
//! [`Frame`] envelope carrying a dataset, an EOF marker, or an error
//! message, or — on execute connections — one serialized runner graph.
//!
//! The [`FrameEncoder`] / [`FrameDecoder`] traits are the seam that lets an
//! exchange treat a TCP peer and the in-process
//! [short-circuit](crate::short_circuit) identically.

mod frame;
mod registry;

pub use frame::{
  Connection, DATA_CONN_TAG, EXECUTE_CONN_TAG, Frame, FrameDecoder,
  FrameEncoder, FrameReader, FrameWriter,
};
pub use registry::{
  TaggedRunner, WireRunner, decode_runner, register, register_builtin,
  wire_runner, wire_runners,
};
