//! Shared test fixtures: small runners with predictable behavior, a
//! single-process cluster helper, and a driver that feeds a runner a
//! dataset sequence and folds its output.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::codec::{TaggedRunner, WireRunner};
use crate::context::RunContext;
use crate::dataset::{Column, Dataset, Type};
use crate::distributer::Distributer;
use crate::error::{Error, Result};
use crate::runner::{ArgsRunner, DatasetReceiver, DatasetSender, Runner, dataset_channel};

/// Feeds `inputs` to the runner, collects its output and folds it into a
/// single dataset (empty on no output). Returns the folded dataset and
/// the run result.
pub async fn run_with<R: Runner + ?Sized>(
  runner: &R,
  inputs: Vec<Dataset>,
) -> (Dataset, Result<()>) {
  let ctx = RunContext::new();
  let (input_tx, input_rx) = mpsc::channel(inputs.len().max(1));
  for data in inputs {
    input_tx.send(data).await.unwrap();
  }
  drop(input_tx);

  let (output_tx, mut output_rx) = dataset_channel();
  let collector = tokio::spawn(async move {
    let mut collected = Vec::new();
    while let Some(data) = output_rx.recv().await {
      collected.push(data);
    }
    collected
  });

  let result = runner.run(ctx, input_rx, output_tx).await;
  let collected = collector.await.unwrap();

  let mut folded = Dataset::default();
  for data in collected {
    folded.append(data).unwrap();
  }
  (folded, result)
}

/// The string values of a dataset's column, for assertions.
pub fn column_strs(data: &Dataset, index: usize) -> Vec<String> {
  match data.column(index) {
    Some(Column::Strs(values)) => values.clone(),
    other => panic!("expected string column at {index}, got {other:?}"),
  }
}

/// Polls `cond` for up to two seconds.
pub async fn eventually(cond: impl Fn() -> bool) -> bool {
  for _ in 0..200 {
    if cond() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  false
}

/// Opt-in log output while debugging: `RUST_LOG=trace cargo test -- --nocapture`.
pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .try_init();
}

/// Binds a distributer to an ephemeral loopback port and starts it on its
/// own task.
pub async fn spawn_node() -> (Distributer, String) {
  init_tracing();
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap().to_string();
  let dist = Distributer::new(addr.clone(), listener);
  let node = dist.clone();
  tokio::spawn(async move { node.start().await });
  (dist, addr)
}

/// Uppercases the first (string) column of every dataset.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Upper;

#[async_trait]
impl Runner for Upper {
  fn returns(&self) -> Vec<Type> {
    vec![Type::Str]
  }

  async fn run(
    &self,
    _ctx: RunContext,
    mut input: DatasetReceiver,
    output: DatasetSender,
  ) -> Result<()> {
    while let Some(data) = input.recv().await {
      let Some(Column::Strs(values)) = data.column(0) else {
        return Err(Error::Message("upper: expected a string column".into()));
      };
      let upper = values.iter().map(|s| s.to_uppercase()).collect::<Vec<_>>();
      if output.send(Dataset::strs(upper)).await.is_err() {
        break;
      }
    }
    Ok(())
  }
}

impl ArgsRunner for Upper {
  fn args(&self) -> Vec<Type> {
    vec![Type::Str]
  }
}

/// Rewrites each string `s` of the first column as `is s?`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Question;

#[async_trait]
impl Runner for Question {
  fn returns(&self) -> Vec<Type> {
    vec![Type::Str]
  }

  async fn run(
    &self,
    _ctx: RunContext,
    mut input: DatasetReceiver,
    output: DatasetSender,
  ) -> Result<()> {
    while let Some(data) = input.recv().await {
      let Some(Column::Strs(values)) = data.column(0) else {
        return Err(Error::Message("question: expected a string column".into()));
      };
      let asked = values.iter().map(|s| format!("is {s}?")).collect::<Vec<_>>();
      if output.send(Dataset::strs(asked)).await.is_err() {
        break;
      }
    }
    Ok(())
  }
}

/// Emits null datasets forever, until cancelled or cut off downstream.
/// The shared flag records whether its run is still live.
#[derive(Debug, Clone, Default)]
pub struct InfinityRunner {
  pub running: Arc<AtomicBool>,
}

#[async_trait]
impl Runner for InfinityRunner {
  fn returns(&self) -> Vec<Type> {
    vec![Type::Null]
  }

  async fn run(
    &self,
    ctx: RunContext,
    _input: DatasetReceiver,
    output: DatasetSender,
  ) -> Result<()> {
    self.running.store(true, Ordering::SeqCst);
    loop {
      tokio::select! {
        _ = ctx.cancelled() => break,
        sent = output.send(Dataset::new(vec![Column::Nulls(1)])) => {
          if sent.is_err() {
            break;
          }
        }
      }
    }
    self.running.store(false, Ordering::SeqCst);
    Ok(())
  }
}

/// Fails immediately with a fixed message.
#[derive(Debug, Clone)]
pub struct ErrRunner {
  pub message: String,
}

impl ErrRunner {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

#[async_trait]
impl Runner for ErrRunner {
  fn returns(&self) -> Vec<Type> {
    Vec::new()
  }

  async fn run(
    &self,
    _ctx: RunContext,
    _input: DatasetReceiver,
    _output: DatasetSender,
  ) -> Result<()> {
    Err(Error::Message(self.message.clone()))
  }
}

/// Everything [`Record`] observed, keyed by node address.
pub static RECORDED: Lazy<Mutex<HashMap<String, Vec<Dataset>>>> =
  Lazy::new(|| Mutex::new(HashMap::new()));

/// All string values recorded for one node, across datasets.
pub fn recorded_strs(node: &str) -> Vec<String> {
  let recorded = RECORDED.lock().unwrap();
  recorded
    .get(node)
    .map(|datasets| {
      datasets
        .iter()
        .flat_map(|d| column_strs(d, 0))
        .collect::<Vec<_>>()
    })
    .unwrap_or_default()
}

/// Forwards its input unchanged while recording it under the executing
/// node's address, so cross-node tests can observe every node's output.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Record;

impl WireRunner for Record {
  const WIRE_TAG: &'static str = "record";
}

#[async_trait]
impl Runner for Record {
  fn returns(&self) -> Vec<Type> {
    vec![Type::Wildcard]
  }

  async fn run(
    &self,
    ctx: RunContext,
    mut input: DatasetReceiver,
    output: DatasetSender,
  ) -> Result<()> {
    let node = ctx
      .cluster()
      .map_or_else(|| "local".to_string(), |c| c.this_node.clone());
    while let Some(data) = input.recv().await {
      RECORDED
        .lock()
        .unwrap()
        .entry(node.clone())
        .or_default()
        .push(data.clone());
      if output.send(data).await.is_err() {
        break;
      }
    }
    Ok(())
  }

  fn wire(&self) -> Result<TaggedRunner> {
    TaggedRunner::encode(Self::WIRE_TAG, self)
  }
}

/// Emits `count` datasets labeled `«node»-«i»`, ignoring its input.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Emit {
  pub count: usize,
}

impl WireRunner for Emit {
  const WIRE_TAG: &'static str = "emit";
}

#[async_trait]
impl Runner for Emit {
  fn returns(&self) -> Vec<Type> {
    vec![Type::Str]
  }

  async fn run(
    &self,
    ctx: RunContext,
    mut input: DatasetReceiver,
    output: DatasetSender,
  ) -> Result<()> {
    let node = ctx
      .cluster()
      .map_or_else(|| "local".to_string(), |c| c.this_node.clone());
    for i in 1..=self.count {
      if output.send(Dataset::strs([format!("{node}-{i}")])).await.is_err() {
        break;
      }
    }
    while input.recv().await.is_some() {}
    Ok(())
  }

  fn wire(&self) -> Result<TaggedRunner> {
    TaggedRunner::encode(Self::WIRE_TAG, self)
  }
}
