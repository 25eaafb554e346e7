//! Crate-wide error type.
//!
//! Every fallible operation in FlowMesh returns [`Error`]. Remote failures
//! are re-raised locally as [`Error::Remote`] with the peer's original
//! message, so `to_string()` on both sides of the wire agrees.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by runners, exchanges and the distributer.
#[derive(Debug, Error)]
pub enum Error {
  /// Transport-level I/O failure (dial, accept, read, write).
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// A frame or runner payload failed to encode or decode.
  #[error("codec error: {0}")]
  Codec(#[from] serde_json::Error),

  /// The rendezvous wait for an incoming data connection expired.
  #[error("connect timeout; no incoming conn")]
  ConnectTimeout,

  /// Write to a closed short-circuit or an exchange with no encoders.
  #[error("closed pipe")]
  ClosedPipe,

  /// An error reported by a peer, message preserved verbatim.
  #[error("{0}")]
  Remote(String),

  /// A plain-message error raised locally.
  #[error("{0}")]
  Message(String),

  /// The surrounding context was cancelled.
  #[error("operation canceled")]
  Canceled,

  /// An accepted connection announced an unknown tag.
  #[error("unrecognized connection tag: {0}")]
  UnrecognizedTag(String),

  /// A shipped runner carried a tag no decoder was registered for.
  #[error("unknown runner wire tag: {0}")]
  UnknownWireTag(String),

  /// The runner type was never registered for wire transport.
  #[error("runner is not registered for wire transport")]
  UnregisteredRunner,

  /// An exchange ran outside a distributed execution.
  #[error("exchange requires a cluster context")]
  MissingCluster,
}
