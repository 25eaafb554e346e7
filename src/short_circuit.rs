//! # Short-circuit Channel
//!
//! An in-process frame queue standing in for a network connection when a
//! node sends to itself. The exchange registers the [`ShortCircuit`] as an
//! outbound encoder and the paired [`ShortCircuitReceiver`] as an inbound
//! decoder, so the local node needs no special case at send or receive
//! time.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::codec::{Frame, FrameDecoder, FrameEncoder};
use crate::error::{Error, Result};

/// Queue capacity of a short-circuit, in frames.
pub const SHORT_CIRCUIT_CAPACITY: usize = 1000;

/// Creates a connected short-circuit pair.
#[must_use]
pub fn short_circuit() -> (ShortCircuit, ShortCircuitReceiver) {
  let (tx, rx) = mpsc::channel(SHORT_CIRCUIT_CAPACITY);
  (ShortCircuit { tx: Some(tx) }, ShortCircuitReceiver { rx })
}

/// The sending side of a short-circuit.
pub struct ShortCircuit {
  tx: Option<mpsc::Sender<Frame>>,
}

#[async_trait]
impl FrameEncoder for ShortCircuit {
  async fn encode(&mut self, frame: Frame) -> Result<()> {
    match &self.tx {
      Some(tx) => tx.send(frame).await.map_err(|_| Error::ClosedPipe),
      None => Err(Error::ClosedPipe),
    }
  }

  /// Closes the queue. Idempotent; the receiver drains what was enqueued
  /// and then observes EOF.
  async fn shutdown(&mut self) -> Result<()> {
    self.tx.take();
    Ok(())
  }
}

/// The receiving side of a short-circuit.
pub struct ShortCircuitReceiver {
  rx: mpsc::Receiver<Frame>,
}

#[async_trait]
impl FrameDecoder for ShortCircuitReceiver {
  async fn decode(&mut self) -> Result<Frame> {
    Ok(self.rx.recv().await.unwrap_or(Frame::Eof))
  }
}
