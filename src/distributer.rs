//! # Distributer
//!
//! The per-node peer registry. A `Distributer` listens for incoming peer
//! connections and classifies each by its handshake tag:
//!
//! - `"D"` — a *data* connection for an exchange. The next handshake string
//!   is the rendezvous key `«originatingPeer»:«exchangeUid»`; the
//!   connection is delivered to whichever [`Distributer::connect`] call is
//!   waiting on that key.
//! - `"X"` — an *execute* connection. One serialized [`DistRunner`] follows;
//!   it is reconstructed and run locally with an empty input.
//!
//! [`Distributer::distribute`] wraps a runner for parallel execution on a
//! named set of peers; the wrapper ships itself over execute connections
//! and injects the [`ClusterContext`] that downstream exchanges read.
//!
//! A `Distributer` is a cheap clonable handle; clones share the listener,
//! the rendezvous map and the dialer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{error, info, trace, warn};

use crate::codec::{
  Connection, DATA_CONN_TAG, EXECUTE_CONN_TAG, TaggedRunner, decode_runner,
  register_builtin,
};
use crate::context::{ClusterContext, RunContext};
use crate::dataset::Type;
use crate::error::{Error, Result};
use crate::runner::{DatasetReceiver, DatasetSender, Runner, dataset_channel};

/// Opens outgoing peer connections.
///
/// The default dials TCP; tests and embedders may substitute their own
/// transport.
#[async_trait]
pub trait Dialer: Send + Sync {
  /// Dials `addr` and returns an established connection.
  async fn dial(&self, addr: &str) -> Result<Connection>;
}

/// The default TCP dialer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
  async fn dial(&self, addr: &str) -> Result<Connection> {
    Ok(Connection::from_stream(TcpStream::connect(addr).await?))
  }
}

/// Configuration for a [`Distributer`].
#[derive(Debug, Clone)]
pub struct DistributerConfig {
  /// How long [`Distributer::connect`] waits for the peer to dial in
  /// before failing the rendezvous.
  pub connect_timeout: Duration,
}

impl Default for DistributerConfig {
  fn default() -> Self {
    Self {
      connect_timeout: Duration::from_secs(1),
    }
  }
}

impl DistributerConfig {
  /// Sets the rendezvous timeout.
  #[must_use]
  pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
    self.connect_timeout = connect_timeout;
    self
  }
}

// Rendezvous slot: delivery side and (mutex-held) pickup side.
type ConnCell = (
  mpsc::Sender<Connection>,
  Arc<tokio::sync::Mutex<mpsc::Receiver<Connection>>>,
);

struct DistributerInner {
  addr: String,
  config: DistributerConfig,
  listener: Mutex<Option<TcpListener>>,
  dialer: Box<dyn Dialer>,
  conns: Mutex<HashMap<String, ConnCell>>,
  shutdown_tx: watch::Sender<bool>,
  shutdown_rx: watch::Receiver<bool>,
  // present once start() has run; close() waits on it
  done: Mutex<Option<watch::Receiver<bool>>>,
}

/// Per-node peer registry and remote-execution server.
#[derive(Clone)]
pub struct Distributer {
  inner: Arc<DistributerInner>,
}

impl Distributer {
  /// Creates a distributer bound to `listener`, announcing itself to
  /// peers as `addr`.
  #[must_use]
  pub fn new(addr: impl Into<String>, listener: TcpListener) -> Self {
    Self::with_options(addr, listener, DistributerConfig::default(), TcpDialer)
  }

  /// Creates a distributer with an explicit configuration and dialer.
  #[must_use]
  pub fn with_options(
    addr: impl Into<String>,
    listener: TcpListener,
    config: DistributerConfig,
    dialer: impl Dialer + 'static,
  ) -> Self {
    register_builtin();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    Self {
      inner: Arc::new(DistributerInner {
        addr: addr.into(),
        config,
        listener: Mutex::new(Some(listener)),
        dialer: Box::new(dialer),
        conns: Mutex::new(HashMap::new()),
        shutdown_tx,
        shutdown_rx,
        done: Mutex::new(None),
      }),
    }
  }

  /// This node's own address.
  #[must_use]
  pub fn addr(&self) -> &str {
    &self.inner.addr
  }

  /// Blocks accepting peer connections until [`Distributer::close`] is
  /// called or the listener fails.
  ///
  /// Each accepted connection is served on its own task. The done signal
  /// is published on every exit path so pending `close` calls unblock.
  pub async fn start(&self) -> Result<()> {
    let listener = self
      .inner
      .listener
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .take()
      .ok_or_else(|| Error::Message("distributer already started".into()))?;

    let (done_tx, done_rx) = watch::channel(false);
    *self
      .inner
      .done
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(done_rx);

    info!(addr = %self.inner.addr, "distributer listening");

    let mut shutdown = self.inner.shutdown_rx.clone();
    let result = loop {
      tokio::select! {
        _ = shutdown.wait_for(|closing| *closing) => break Ok(()),
        accepted = listener.accept() => match accepted {
          Ok((stream, peer)) => {
            trace!(peer = %peer, "accepted peer connection");
            let node = self.clone();
            tokio::spawn(async move {
              if let Err(e) = node.serve(Connection::from_stream(stream)).await {
                warn!(peer = %peer, error = %e, "peer connection failed");
              }
            });
          }
          Err(e) => break Err(Error::Io(e)),
        },
      }
    };

    // release the port before unblocking close(), so a rebind succeeds
    drop(listener);
    let _ = done_tx.send(true);
    result
  }

  /// Stops accepting and waits for [`Distributer::start`] to return.
  pub async fn close(&self) -> Result<()> {
    let _ = self.inner.shutdown_tx.send(true);
    let done = self
      .inner
      .done
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .clone();
    if let Some(mut done) = done {
      let _ = done.wait_for(|finished| *finished).await;
    }
    Ok(())
  }

  /// Wraps `runner` for parallel execution on `addrs`, with this node as
  /// master.
  ///
  /// The address list is sorted so every participant sees the same node
  /// ordering.
  #[must_use]
  pub fn distribute<I, S>(&self, runner: Arc<dyn Runner>, addrs: I) -> DistRunner
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let mut addrs: Vec<String> = addrs.into_iter().map(Into::into).collect();
    addrs.sort();
    DistRunner {
      inner: runner,
      addrs,
      master: self.inner.addr.clone(),
      dist: self.clone(),
    }
  }

  /// Rendezvous with `addr` for the logical stream `uid`.
  ///
  /// Both sides of the pair call this with the same `uid` and end up
  /// holding the two ends of one connection: the side whose own address is
  /// lexicographically smaller dials and announces itself, the other side
  /// waits for the listener to deliver the announced connection.
  pub async fn connect(&self, addr: &str, uid: &str) -> Result<Connection> {
    if self.inner.addr.as_str() < addr {
      let mut conn = self.inner.dialer.dial(addr).await?;
      conn.write_str(DATA_CONN_TAG).await?;
      conn
        .write_str(&format!("{}:{}", self.inner.addr, uid))
        .await?;
      Ok(conn)
    } else {
      let key = format!("{addr}:{uid}");
      let cell = self.conn_cell(&key);
      let mut pickup = cell.1.lock().await;
      match timeout(self.inner.config.connect_timeout, pickup.recv()).await {
        Ok(Some(conn)) => Ok(conn),
        Ok(None) | Err(_) => Err(Error::ConnectTimeout),
      }
    }
  }

  /// Serves one accepted connection: classifies it by handshake tag and
  /// either delivers it to a waiting exchange or runs the shipped graph.
  ///
  /// Protocol errors are logged by the caller and never propagate beyond
  /// this connection's task.
  pub async fn serve(&self, mut conn: Connection) -> Result<()> {
    let tag = conn.read_str().await?;
    match tag.as_str() {
      DATA_CONN_TAG => {
        let key = conn.read_str().await?;
        trace!(key = %key, "delivering data connection");
        let cell = self.conn_cell(&key);
        cell.0.send(conn).await.map_err(|_| Error::ClosedPipe)
      }
      EXECUTE_CONN_TAG => {
        let wire: DistRunnerWire = conn.read_obj().await?.ok_or_else(|| {
          Error::Message("execute connection closed before runner payload".into())
        })?;
        let runner = DistRunner::from_wire(wire, self.clone())?;
        self.run_remote(runner).await
        // the connection drops, and closes, when the run is over
      }
      other => {
        let err = Error::UnrecognizedTag(other.to_string());
        error!(error = %err, "rejecting peer connection");
        Err(err)
      }
    }
  }

  // Runs a shipped graph with a closed empty input. The graph's root
  // output has no local consumer here; it is drained, and peers observe
  // data only through the exchanges inside the graph.
  async fn run_remote(&self, runner: DistRunner) -> Result<()> {
    let (input_tx, input_rx) = dataset_channel();
    drop(input_tx);
    let (output_tx, mut output_rx) = dataset_channel();
    let drain = tokio::spawn(async move { while output_rx.recv().await.is_some() {} });

    let result = runner.run(RunContext::new(), input_rx, output_tx).await;
    let _ = drain.await;
    if let Err(e) = &result {
      error!(error = %e, "remote runner failed");
    }
    result
  }

  fn conn_cell(&self, key: &str) -> ConnCell {
    let mut conns = self
      .inner
      .conns
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    conns
      .entry(key.to_string())
      .or_insert_with(|| {
        let (tx, rx) = mpsc::channel(1);
        (tx, Arc::new(tokio::sync::Mutex::new(rx)))
      })
      .clone()
  }

  pub(crate) async fn dial(&self, addr: &str) -> Result<Connection> {
    self.inner.dialer.dial(addr).await
  }
}

/// Wire form of [`DistRunner`]: everything except the local back-pointer.
#[derive(Serialize, Deserialize)]
pub(crate) struct DistRunnerWire {
  runner: TaggedRunner,
  addrs: Vec<String>,
  master: String,
}

/// A runner wrapped for distributed execution.
///
/// On its first `run` — on the master node only — it ships itself to every
/// other participant over an execute connection, then runs the inner
/// runner locally with the [`ClusterContext`] injected. Peers entering
/// through [`Distributer::serve`] skip the fan-out.
pub struct DistRunner {
  inner: Arc<dyn Runner>,
  addrs: Vec<String>,
  master: String,
  dist: Distributer,
}

impl DistRunner {
  fn to_wire(&self) -> Result<DistRunnerWire> {
    Ok(DistRunnerWire {
      runner: self.inner.wire()?,
      addrs: self.addrs.clone(),
      master: self.master.clone(),
    })
  }

  fn from_wire(wire: DistRunnerWire, dist: Distributer) -> Result<Self> {
    Ok(Self {
      inner: decode_runner(&wire.runner)?,
      addrs: wire.addrs,
      master: wire.master,
      dist,
    })
  }
}

#[async_trait]
impl Runner for DistRunner {
  fn returns(&self) -> Vec<Type> {
    self.inner.returns()
  }

  async fn run(
    &self,
    ctx: RunContext,
    input: DatasetReceiver,
    output: DatasetSender,
  ) -> Result<()> {
    // fan out, master only; the connections stay open until the local run
    // is over
    let mut held = Vec::new();
    let is_master = self.dist.addr() == self.master;
    if is_master && self.addrs.iter().any(|a| a != self.dist.addr()) {
      let wire = self.to_wire()?;
      for addr in &self.addrs {
        if addr == self.dist.addr() {
          continue;
        }
        let mut conn = self.dist.dial(addr).await?;
        conn.write_str(EXECUTE_CONN_TAG).await?;
        conn.write_obj(&wire).await?;
        held.push(conn);
      }
    }

    let ctx = ctx.with_cluster(ClusterContext {
      all_nodes: self.addrs.clone(),
      this_node: self.dist.addr().to_string(),
      master_node: self.master.clone(),
      distributer: self.dist.clone(),
    });

    let result = self.inner.run(ctx, input, output).await;
    drop(held);
    result
  }
}
