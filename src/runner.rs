//! # Runner Trait
//!
//! This module defines the `Runner` trait: the streaming-operator contract
//! every FlowMesh component implements. A runner receives datasets from an
//! input stream, transforms them, and emits datasets on an output stream.
//!
//! ## Contract
//!
//! - **Input termination**: `run` returns only after the input stream is
//!   observed closed, an error is produced, or the context is cancelled.
//! - **Stream ownership**: the caller owns both streams. A runner never
//!   closes the streams it was given; streams it creates for sub-runners
//!   are its own responsibility (dropping the sender closes a stream).
//! - **Cancellation**: long-running producing runners must watch
//!   [`RunContext::cancelled`] and return promptly when it fires. Short
//!   transformers may rely on upstream closure instead.
//! - **Concurrency**: runners execute concurrently and take `&self`;
//!   shared state must be `Sync`, and received datasets are never mutated
//!   in place.
//! - **Types**: every emitted dataset has exactly `returns().len()`
//!   columns; wildcard entries match any concrete type. Violations are
//!   programming errors and may panic downstream.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::codec::{TaggedRunner, WireRunner};
use crate::context::RunContext;
use crate::dataset::{Dataset, Type};
use crate::error::{Error, Result};

/// Sending half of a dataset stream.
pub type DatasetSender = mpsc::Sender<Dataset>;

/// Receiving half of a dataset stream.
pub type DatasetReceiver = mpsc::Receiver<Dataset>;

/// Creates a dataset stream with the standard run-stream capacity.
#[must_use]
pub fn dataset_channel() -> (DatasetSender, DatasetReceiver) {
  mpsc::channel(1)
}

impl std::fmt::Debug for dyn Runner {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Runner").finish()
  }
}

/// A streaming operator over datasets.
#[async_trait]
pub trait Runner: Send + Sync {
  /// The constant list of column types this runner produces.
  ///
  /// Must be a pure function of the runner's configuration, stable across
  /// calls. Use [`Type::Wildcard`] when the output type depends on the
  /// input.
  fn returns(&self) -> Vec<Type>;

  /// Consumes `input` until it closes, emitting results on `output`.
  ///
  /// A non-`Ok` return aborts the local graph; the surrounding driver is
  /// expected to cancel sibling runners and drain.
  async fn run(
    &self,
    ctx: RunContext,
    input: DatasetReceiver,
    output: DatasetSender,
  ) -> Result<()>;

  /// Wire encoding for shipping this runner to peers.
  ///
  /// The default refuses; runners registered with
  /// [`crate::codec::register`] override this with their tagged form.
  fn wire(&self) -> Result<TaggedRunner> {
    Err(Error::UnregisteredRunner)
  }
}

/// A runner that also declares the input types it accepts.
pub trait ArgsRunner: Runner {
  /// The list of column types this runner requires as input.
  fn args(&self) -> Vec<Type>;
}

/// A runner that can specialize itself from a context-dependent argument,
/// such as a query plan node. The returned runner is what actually
/// executes.
#[async_trait]
pub trait PlanRunner: Runner {
  /// Plans a specialized runner from `arg`.
  async fn plan(
    &self,
    ctx: &RunContext,
    arg: &(dyn Any + Send + Sync),
  ) -> Result<Arc<dyn Runner>>;
}

/// The identity runner: forwards every dataset unchanged.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PassThrough;

/// Returns the identity runner.
#[must_use]
pub fn pass_through() -> PassThrough {
  PassThrough
}

impl WireRunner for PassThrough {
  const WIRE_TAG: &'static str = "passthrough";
}

#[async_trait]
impl Runner for PassThrough {
  fn returns(&self) -> Vec<Type> {
    vec![Type::Wildcard]
  }

  async fn run(
    &self,
    _ctx: RunContext,
    mut input: DatasetReceiver,
    output: DatasetSender,
  ) -> Result<()> {
    while let Some(data) = input.recv().await {
      if output.send(data).await.is_err() {
        break; // downstream hung up
      }
    }
    Ok(())
  }

  fn wire(&self) -> Result<TaggedRunner> {
    TaggedRunner::encode(Self::WIRE_TAG, self)
  }
}
