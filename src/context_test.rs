use std::time::Duration;

use crate::context::RunContext;

#[tokio::test]
async fn cancel_is_observed_by_clones() {
  let ctx = RunContext::new();
  let clone = ctx.clone();
  assert!(!clone.is_cancelled());

  ctx.cancel();
  assert!(clone.is_cancelled());
  clone.cancelled().await; // resolves immediately
}

#[tokio::test]
async fn parent_cancel_reaches_children() {
  let parent = RunContext::new();
  let child = parent.child();

  parent.cancel();
  assert!(child.is_cancelled());
  child.cancelled().await;
}

#[tokio::test]
async fn child_cancel_leaves_parent_untouched() {
  let parent = RunContext::new();
  let child = parent.child();

  child.cancel();
  assert!(child.is_cancelled());
  assert!(!parent.is_cancelled());
}

#[tokio::test]
async fn cancelled_wakes_a_pending_waiter() {
  let ctx = RunContext::new();
  let waiter = ctx.clone();
  let waited = tokio::spawn(async move {
    waiter.cancelled().await;
  });

  tokio::time::sleep(Duration::from_millis(10)).await;
  ctx.cancel();
  tokio::time::timeout(Duration::from_secs(1), waited)
    .await
    .expect("waiter should wake on cancel")
    .unwrap();
}
