//! # Project
//!
//! Parallel composition: every input dataset is duplicated to each
//! sub-runner, and one output dataset from each is zipped into a single
//! wide dataset, columns side by side in runner order. The combined
//! return type is the concatenation of the sub-runners' return types.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::codec::{TaggedRunner, WireRunner};
use crate::context::RunContext;
use crate::dataset::{Column, Dataset, Type};
use crate::error::{Error, Result};
use crate::runner::{DatasetReceiver, DatasetSender, Runner, dataset_channel};

/// Runs runners side by side over the same input, combining their output
/// columns.
#[derive(Clone, Serialize, Deserialize)]
pub struct Project {
  #[serde(with = "crate::codec::wire_runners")]
  runners: Vec<Arc<dyn Runner>>,
}

impl Project {
  /// Composes `runners` into a projection.
  #[must_use]
  pub fn new(runners: Vec<Arc<dyn Runner>>) -> Self {
    Self { runners }
  }
}

impl WireRunner for Project {
  const WIRE_TAG: &'static str = "project";
}

#[async_trait]
impl Runner for Project {
  fn returns(&self) -> Vec<Type> {
    self.runners.iter().flat_map(|r| r.returns()).collect()
  }

  async fn run(
    &self,
    ctx: RunContext,
    mut input: DatasetReceiver,
    output: DatasetSender,
  ) -> Result<()> {
    if self.runners.is_empty() {
      while input.recv().await.is_some() {}
      return Ok(());
    }

    let child = ctx.child();
    let mut branches = JoinSet::new();
    let mut feeds: Vec<DatasetSender> = Vec::with_capacity(self.runners.len());
    let mut taps: Vec<DatasetReceiver> = Vec::with_capacity(self.runners.len());
    for runner in self.runners.iter().cloned() {
      let (feed_tx, feed_rx) = dataset_channel();
      let (tap_tx, tap_rx) = dataset_channel();
      let branch_ctx = child.clone();
      branches.spawn(async move { runner.run(branch_ctx, feed_rx, tap_tx).await });
      feeds.push(feed_tx);
      taps.push(tap_rx);
    }

    // duplicate the input to every branch; a dead branch stops the feed
    // and closes the others
    let feeder = tokio::spawn(async move {
      while let Some(data) = input.recv().await {
        for feed in &feeds {
          if feed.send(data.clone()).await.is_err() {
            return;
          }
        }
      }
    });

    // zip one dataset from each branch into one wide dataset; a branch
    // that closes mid-round ends the output without emitting the partial
    // round
    'zip: loop {
      let mut combined: Vec<Column> = Vec::new();
      for tap in &mut taps {
        match tap.recv().await {
          Some(data) => combined.extend(data.into_columns()),
          None => break 'zip,
        }
      }
      if output.send(Dataset::new(combined)).await.is_err() {
        break;
      }
    }
    drop(taps);

    // reap the branches; the first failure cancels the rest
    let mut failure: Option<Error> = None;
    while let Some(finished) = branches.join_next().await {
      let branch_result = match finished {
        Ok(result) => result,
        Err(e) => Err(Error::Message(format!("project branch failed: {e}"))),
      };
      if let Err(e) = branch_result {
        child.cancel();
        failure.get_or_insert(e);
      }
    }

    feeder.abort();
    let _ = feeder.await;

    match failure {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  fn wire(&self) -> Result<TaggedRunner> {
    TaggedRunner::encode(Self::WIRE_TAG, self)
  }
}
