use std::sync::Arc;

use crate::dataset::{Dataset, Type};
use crate::pipeline::Pipeline;
use crate::runner::{PassThrough, Runner};
use crate::test_util::{ErrRunner, InfinityRunner, Question, Upper, column_strs, run_with};

#[tokio::test]
async fn stages_chain_in_order() {
  let runner = Pipeline::new(vec![Arc::new(Upper), Arc::new(Question)]);
  let (out, result) = run_with(&runner, vec![Dataset::strs(["hello", "world"])]).await;

  result.unwrap();
  assert_eq!(column_strs(&out, 0), vec!["is HELLO?", "is WORLD?"]);
}

#[tokio::test]
async fn an_empty_pipeline_forwards_its_input() {
  let runner = Pipeline::new(Vec::new());
  let (out, result) = run_with(&runner, vec![Dataset::strs(["hello"])]).await;

  result.unwrap();
  assert_eq!(column_strs(&out, 0), vec!["hello"]);
}

#[test]
fn returns_follows_the_last_stage() {
  let runner = Pipeline::new(vec![Arc::new(Upper), Arc::new(PassThrough)]);
  assert_eq!(runner.returns(), vec![Type::Wildcard]);

  let runner = Pipeline::new(vec![Arc::new(PassThrough), Arc::new(Upper)]);
  assert_eq!(runner.returns(), vec![Type::Str]);
}

#[tokio::test]
async fn a_failing_stage_cancels_the_others() {
  let infinity = InfinityRunner::default();
  let running = Arc::clone(&infinity.running);
  let runner = Pipeline::new(vec![
    Arc::new(infinity),
    Arc::new(ErrRunner::new("something bad happened")),
  ]);
  let (out, result) = run_with(&runner, vec![Dataset::strs(["x"])]).await;

  assert_eq!(out.width(), 0);
  let err = result.unwrap_err();
  assert_eq!(err.to_string(), "something bad happened");
  assert!(
    !running.load(std::sync::atomic::Ordering::SeqCst),
    "infinity stage leaked"
  );
}
