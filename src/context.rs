//! # Run Context
//!
//! Every runner invocation receives a [`RunContext`]: a cheap, clonable
//! handle carrying a cooperative cancellation signal and, inside a
//! distributed execution, the [`ClusterContext`] describing the mesh.
//!
//! Cancellation is hierarchical. A [`RunContext::child`] observes its
//! parent's cancellation but can be cancelled independently, which is how
//! composed runners stop their siblings when one of them fails without
//! tearing down the rest of the graph.

use std::sync::Arc;

use tokio::sync::watch;

use crate::distributer::Distributer;

/// Execution environment injected by the distributed wrapper.
///
/// Exchanges read this to build their mesh: the stable, ordered list of
/// participating nodes, this node's own address, the master that initiated
/// the distribution, and the local distributer used to open peer
/// connections.
#[derive(Clone)]
pub struct ClusterContext {
  /// Ordered list of participating node addresses, identical on every node.
  pub all_nodes: Vec<String>,
  /// Address of the node this runner executes on.
  pub this_node: String,
  /// Address of the node that initiated the distributed execution.
  pub master_node: String,
  /// The local distributer, used by exchanges to connect to peers.
  pub distributer: Distributer,
}

/// Cancellation scope and execution environment for one runner graph.
#[derive(Clone)]
pub struct RunContext {
  cancel: Arc<watch::Sender<bool>>,
  // own signal last; ancestors before it, root first
  watchers: Vec<watch::Receiver<bool>>,
  cluster: Option<Arc<ClusterContext>>,
}

impl RunContext {
  /// Creates a fresh root context.
  #[must_use]
  pub fn new() -> Self {
    let (tx, rx) = watch::channel(false);
    Self {
      cancel: Arc::new(tx),
      watchers: vec![rx],
      cluster: None,
    }
  }

  /// Derives a child scope: cancelling the child leaves this context
  /// untouched, while cancelling this context also cancels the child.
  #[must_use]
  pub fn child(&self) -> Self {
    let (tx, rx) = watch::channel(false);
    let mut watchers = self.watchers.clone();
    watchers.push(rx);
    Self {
      cancel: Arc::new(tx),
      watchers,
      cluster: self.cluster.clone(),
    }
  }

  /// Cancels this scope and every scope derived from it.
  pub fn cancel(&self) {
    let _ = self.cancel.send(true);
  }

  /// Whether this scope or any ancestor has been cancelled.
  #[must_use]
  pub fn is_cancelled(&self) -> bool {
    self.watchers.iter().any(|rx| *rx.borrow())
  }

  /// Resolves once this scope or any ancestor is cancelled.
  pub async fn cancelled(&self) {
    let waits = self
      .watchers
      .iter()
      .map(|rx| {
        let mut rx = rx.clone();
        Box::pin(async move {
          // A dropped sender is not a cancellation; park forever.
          if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            futures::future::pending::<()>().await;
          }
        })
      })
      .collect::<Vec<_>>();
    futures::future::select_all(waits).await;
  }

  /// Attaches the cluster environment for a distributed execution.
  #[must_use]
  pub fn with_cluster(mut self, cluster: ClusterContext) -> Self {
    self.cluster = Some(Arc::new(cluster));
    self
  }

  /// The cluster environment, if this is a distributed execution.
  #[must_use]
  pub fn cluster(&self) -> Option<&ClusterContext> {
    self.cluster.as_deref()
  }
}

impl Default for RunContext {
  fn default() -> Self {
    Self::new()
  }
}
