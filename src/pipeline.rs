//! # Pipeline
//!
//! Sequential composition: the output stream of each runner feeds the
//! input of the next. Every stage runs on its own task under a child
//! context, so a failing stage cancels its siblings instead of leaving
//! them running against dead streams.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::codec::{TaggedRunner, WireRunner};
use crate::context::RunContext;
use crate::dataset::Type;
use crate::error::{Error, Result};
use crate::runner::{DatasetReceiver, DatasetSender, Runner, dataset_channel};

/// Runs a list of runners one after another, streaming between them.
#[derive(Clone, Serialize, Deserialize)]
pub struct Pipeline {
  #[serde(with = "crate::codec::wire_runners")]
  runners: Vec<Arc<dyn Runner>>,
}

impl Pipeline {
  /// Composes `runners` into a pipeline.
  #[must_use]
  pub fn new(runners: Vec<Arc<dyn Runner>>) -> Self {
    Self { runners }
  }
}

impl WireRunner for Pipeline {
  const WIRE_TAG: &'static str = "pipeline";
}

#[async_trait]
impl Runner for Pipeline {
  fn returns(&self) -> Vec<Type> {
    self.runners.last().map(|r| r.returns()).unwrap_or_default()
  }

  async fn run(
    &self,
    ctx: RunContext,
    input: DatasetReceiver,
    output: DatasetSender,
  ) -> Result<()> {
    if self.runners.is_empty() {
      let mut input = input;
      while let Some(data) = input.recv().await {
        if output.send(data).await.is_err() {
          break;
        }
      }
      return Ok(());
    }

    // wire the stages together: input -> r0 -> ch0 -> r1 -> ... -> output
    let stage_count = self.runners.len();
    let mut senders: Vec<DatasetSender> = Vec::with_capacity(stage_count);
    let mut receivers: Vec<DatasetReceiver> = Vec::with_capacity(stage_count - 1);
    for _ in 0..stage_count - 1 {
      let (tx, rx) = dataset_channel();
      senders.push(tx);
      receivers.push(rx);
    }
    senders.push(output);

    let child = ctx.child();
    let mut stages = JoinSet::new();
    let inputs = std::iter::once(input).chain(receivers);
    for ((runner, stage_input), stage_output) in
      self.runners.iter().cloned().zip(inputs).zip(senders)
    {
      let stage_ctx = child.clone();
      stages.spawn(async move { runner.run(stage_ctx, stage_input, stage_output).await });
    }

    // reap in completion order; the first failure cancels the rest
    let mut failure: Option<Error> = None;
    while let Some(finished) = stages.join_next().await {
      let stage_result = match finished {
        Ok(result) => result,
        Err(e) => Err(Error::Message(format!("pipeline stage failed: {e}"))),
      };
      if let Err(e) = stage_result {
        child.cancel();
        failure.get_or_insert(e);
      }
    }

    match failure {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  fn wire(&self) -> Result<TaggedRunner> {
    TaggedRunner::encode(Self::WIRE_TAG, self)
  }
}
