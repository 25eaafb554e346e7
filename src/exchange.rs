//! # Exchange Operator
//!
//! A runner that moves datasets between the nodes of a distributed
//! execution under a routing [`Policy`]. On `run`, each exchange instance
//! builds a per-invocation mesh: one connection to every peer it sends to
//! or receives from, keyed by the exchange's UID so that the instances of
//! the same exchange on different nodes find each other. The local node is
//! wired through a [short-circuit](crate::short_circuit) instead of a
//! socket, and the same connection carries both directions of a node
//! pair's traffic.
//!
//! Sending and receiving run concurrently: a background task round-robins
//! over the inbound decoders and forwards everything into the local output
//! stream, while the foreground loop dispatches local input under the
//! policy until the input closes, then notifies all peers with an EOF
//! frame. Any error is broadcast to the peers before the mesh is torn
//! down.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::codec::{Frame, FrameDecoder, FrameEncoder, FrameReader, FrameWriter, TaggedRunner, WireRunner};
use crate::context::{ClusterContext, RunContext};
use crate::dataset::{Dataset, Type};
use crate::error::{Error, Result};
use crate::runner::{DatasetReceiver, DatasetSender, Runner};
use crate::short_circuit::{ShortCircuitReceiver, short_circuit};

/// How an exchange routes outbound datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
  /// Round-robin one dataset per node.
  Scatter,
  /// Send everything to the master node.
  Gather,
  /// Send everything to every node.
  Broadcast,
  /// Route each dataset by a hash of the designated column.
  Partition { column: usize },
}

/// Returns an exchange that scatters its input uniformly across all
/// nodes, one dataset per node in a round-robin.
#[must_use]
pub fn scatter() -> Exchange {
  Exchange::new(Policy::Scatter)
}

/// Returns an exchange that gathers all input onto the master node. Every
/// other node produces no output.
#[must_use]
pub fn gather() -> Exchange {
  Exchange::new(Policy::Gather)
}

/// Returns an exchange that duplicates its input to all nodes; every
/// node's output is the union of all inputs, order unspecified.
#[must_use]
pub fn broadcast() -> Exchange {
  Exchange::new(Policy::Broadcast)
}

/// Returns an exchange that routes each dataset to the node selected by a
/// hash of the dataset's `column` modulo the node count. Batches are
/// routed whole.
#[must_use]
pub fn partition(column: usize) -> Exchange {
  Exchange::new(Policy::Partition { column })
}

/// A runner that shuffles datasets among peers under a routing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
  uid: String,
  policy: Policy,
}

impl Exchange {
  /// Creates an exchange with a fresh UID and the given policy.
  #[must_use]
  pub fn new(policy: Policy) -> Self {
    Self {
      uid: Uuid::new_v4().to_string(),
      policy,
    }
  }

  /// The per-exchange identifier, preserved across serialization.
  #[must_use]
  pub fn uid(&self) -> &str {
    &self.uid
  }

  /// The routing policy.
  #[must_use]
  pub fn policy(&self) -> Policy {
    self.policy
  }

  // Builds the mesh for one invocation. On failure, whatever was already
  // opened is released before the error is returned.
  async fn init(&self, ctx: &RunContext) -> Result<(Mesh, MeshReceiver)> {
    let cluster = ctx.cluster().ok_or(Error::MissingCluster)?;
    let mut mesh = Mesh::new(self.policy);
    let mut receiver = MeshReceiver::new();
    match self.link(cluster, &mut mesh, &mut receiver).await {
      Ok(()) => Ok((mesh, receiver)),
      Err(e) => {
        if let Err(close_err) = mesh.close(None).await {
          warn!(error = %close_err, "exchange init cleanup failed");
        }
        Err(e)
      }
    }
  }

  async fn link(
    &self,
    cluster: &ClusterContext,
    mesh: &mut Mesh,
    receiver: &mut MeshReceiver,
  ) -> Result<()> {
    let this = &cluster.this_node;
    let targets: &[String] = match self.policy {
      Policy::Gather => std::slice::from_ref(&cluster.master_node),
      _ => &cluster.all_nodes,
    };

    // open a connection to every node we send to; sending to ourselves
    // goes through a short-circuit instead
    let mut readers: HashMap<String, FrameReader> = HashMap::new();
    let mut local: Option<ShortCircuitReceiver> = None;
    for node in targets {
      if node == this {
        let (sc, sc_rx) = short_circuit();
        mesh.encoders.push(Box::new(sc));
        local = Some(sc_rx);
        continue;
      }
      trace!(uid = %self.uid, peer = %node, "exchange connecting to send target");
      let conn = cluster.distributer.connect(node, &self.uid).await?;
      let (reader, writer) = conn.split();
      mesh.encoders.push(Box::new(writer));
      readers.insert(node.clone(), reader);
    }

    // if we are ourselves a destination, we also receive from every node,
    // reusing the read side of send-target connections so each node pair
    // shares exactly one connection per exchange
    if let Some(sc_rx) = local {
      let mut sc_rx = Some(sc_rx);
      for node in &cluster.all_nodes {
        if node == this {
          if let Some(rx) = sc_rx.take() {
            receiver.decoders.push(Box::new(rx));
          }
          continue;
        }
        if let Some(reader) = readers.remove(node) {
          receiver.decoders.push(Box::new(reader));
          continue;
        }
        trace!(uid = %self.uid, peer = %node, "exchange connecting to receive source");
        let conn = cluster.distributer.connect(node, &self.uid).await?;
        let (reader, writer) = conn.split();
        receiver.decoders.push(Box::new(reader));
        mesh.spare_writers.push(writer);
      }
    }

    // read sides of send-only connections stay alive until teardown
    mesh.spare_readers.extend(readers.into_values());
    Ok(())
  }
}

impl WireRunner for Exchange {
  const WIRE_TAG: &'static str = "exchange";
}

#[async_trait]
impl Runner for Exchange {
  fn returns(&self) -> Vec<Type> {
    vec![Type::Wildcard]
  }

  async fn run(
    &self,
    ctx: RunContext,
    mut input: DatasetReceiver,
    output: DatasetSender,
  ) -> Result<()> {
    let (mut mesh, receiver) = self.init(&ctx).await?;

    // receive remote data and forward it into the local output stream
    let forward_to = output.clone();
    let mut recv_task = tokio::spawn(async move {
      let mut receiver = receiver;
      loop {
        match receiver.decode_next().await {
          Ok(Some(data)) => {
            if forward_to.send(data).await.is_err() {
              break Ok(()); // downstream hung up
            }
          }
          Ok(None) => break Ok(()),
          Err(e) => break Err(e),
        }
      }
    });

    // dispatch local input until it closes, watching the receive task and
    // the context; exit when both directions are done or anything fails
    let mut send_done = false;
    let mut recv_done = false;
    let mut failure: Option<Error> = None;
    while failure.is_none() && !(send_done && recv_done) {
      tokio::select! {
        item = input.recv(), if !send_done => match item {
          Some(data) => {
            if let Err(e) = mesh.send(data).await {
              failure = Some(e);
            }
          }
          None => {
            // input exhausted; tell the peers to stop listening to us
            if let Err(e) = mesh.encode_all(Frame::Eof).await {
              failure = Some(e);
            }
            send_done = true;
          }
        },
        finished = &mut recv_task, if !recv_done => {
          recv_done = true;
          match finished {
            Ok(Ok(())) => {}
            Ok(Err(e)) => failure = Some(e),
            Err(e) => {
              failure = Some(Error::Message(format!("exchange receive task failed: {e}")));
            }
          }
        },
        _ = ctx.cancelled() => failure = Some(Error::Canceled),
      }
    }

    if !recv_done {
      recv_task.abort();
      let _ = (&mut recv_task).await;
    }

    if let Err(e) = mesh.close(failure.as_ref()).await {
      warn!(uid = %self.uid, error = %e, "exchange close failed");
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

/// Outbound half of one exchange invocation.
pub(crate) struct Mesh {
  pub(crate) encoders: Vec<Box<dyn FrameEncoder>>,
  pub(crate) enc_next: usize,
  pub(crate) policy: Policy,
  // read sides of send-only connections, held open until teardown
  pub(crate) spare_readers: Vec<FrameReader>,
  // write sides of receive-only connections, half-closed at teardown
  pub(crate) spare_writers: Vec<FrameWriter>,
}

impl Mesh {
  pub(crate) fn new(policy: Policy) -> Self {
    Self {
      encoders: Vec::new(),
      enc_next: 0,
      policy,
      spare_readers: Vec::new(),
      spare_writers: Vec::new(),
    }
  }

  /// Dispatches one dataset under the policy.
  pub(crate) async fn send(&mut self, data: Dataset) -> Result<()> {
    match self.policy {
      Policy::Scatter => self.encode_next(Frame::Data(data)).await,
      Policy::Partition { column } => self.encode_partition(column, data).await,
      Policy::Gather | Policy::Broadcast => self.encode_all(Frame::Data(data)).await,
    }
  }

  /// Encodes a frame to every destination; the last error wins but every
  /// destination is attempted.
  pub(crate) async fn encode_all(&mut self, frame: Frame) -> Result<()> {
    let mut result = Ok(());
    for encoder in &mut self.encoders {
      if let Err(e) = encoder.encode(frame.clone()).await {
        result = Err(e);
      }
    }
    result
  }

  /// Encodes a frame to the next destination in a round-robin.
  pub(crate) async fn encode_next(&mut self, frame: Frame) -> Result<()> {
    if self.encoders.is_empty() {
      return Err(Error::ClosedPipe);
    }
    self.enc_next = (self.enc_next + 1) % self.encoders.len();
    self.encoders[self.enc_next].encode(frame).await
  }

  /// Encodes a dataset to the destination selected by hashing `column`.
  pub(crate) async fn encode_partition(&mut self, column: usize, data: Dataset) -> Result<()> {
    if self.encoders.is_empty() {
      return Err(Error::ClosedPipe);
    }
    let col = data.column(column).ok_or_else(|| {
      Error::Message(format!("partition column {column} out of range"))
    })?;
    let mut hasher = DefaultHasher::new();
    col.hash(&mut hasher);
    let index = (hasher.finish() as usize) % self.encoders.len();
    self.encoders[index].encode(Frame::Data(data)).await
  }

  /// Tears the mesh down. If a failure is supplied, it is first encoded to
  /// every destination so peers surface it; every encoder is then
  /// half-closed (flushing in-flight frames) before the connections are
  /// released.
  pub(crate) async fn close(&mut self, failure: Option<&Error>) -> Result<()> {
    if let Some(err) = failure {
      if let Err(e) = self
        .encode_all(Frame::Error {
          message: err.to_string(),
        })
        .await
      {
        warn!(error = %e, "failed to notify peers of exchange error");
      }
    }

    let mut result = Ok(());
    for encoder in &mut self.encoders {
      if let Err(e) = encoder.shutdown().await {
        result = Err(e);
      }
    }
    for writer in &mut self.spare_writers {
      if let Err(e) = writer.shutdown().await {
        result = Err(e);
      }
    }
    self.spare_readers.clear();
    result
  }
}

/// Inbound half of one exchange invocation.
pub(crate) struct MeshReceiver {
  pub(crate) decoders: Vec<Box<dyn FrameDecoder>>,
  pub(crate) dec_next: usize,
}

impl MeshReceiver {
  pub(crate) fn new() -> Self {
    Self {
      decoders: Vec::new(),
      dec_next: 0,
    }
  }

  /// Decodes the next dataset in a round-robin over the sources.
  ///
  /// An exhausted source is removed and the next one tried, so peers
  /// interleave fairly and the stream ends (`Ok(None)`) once every source
  /// has signalled EOF. A remote error frame is re-raised as
  /// [`Error::Remote`].
  pub(crate) async fn decode_next(&mut self) -> Result<Option<Dataset>> {
    loop {
      if self.decoders.is_empty() {
        return Ok(None);
      }
      let i = (self.dec_next + 1) % self.decoders.len();
      let frame = self.decoders[i].decode().await?;
      match frame {
        Frame::Data(data) => {
          self.dec_next = i;
          return Ok(Some(data));
        }
        Frame::Eof => {
          self.decoders.remove(i);
        }
        Frame::Error { message } => return Err(Error::Remote(message)),
      }
    }
  }
}
