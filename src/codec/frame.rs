//! Frame envelopes, handshake strings and connection halves.

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::dataset::Dataset;
use crate::error::Result;

/// Handshake tag announcing a data connection.
pub const DATA_CONN_TAG: &str = "D";

/// Handshake tag announcing an execute (remote runner) connection.
pub const EXECUTE_CONN_TAG: &str = "X";

/// The envelope framing everything sent after the handshake.
///
/// A clean end of the underlying stream decodes as [`Frame::Eof`], so
/// receivers see one uniform end-of-stream signal whether the peer said
/// goodbye explicitly or simply hung up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frame {
  /// One dataset batch.
  Data(Dataset),
  /// The sender is done; no more data will arrive from it.
  Eof,
  /// The sender failed; the message is re-raised on the receiving side.
  Error { message: String },
}

/// Writes an object to a peer as one newline-delimited JSON frame.
#[async_trait]
pub trait FrameEncoder: Send {
  /// Encodes one frame.
  async fn encode(&mut self, frame: Frame) -> Result<()>;

  /// Half-closes the sending side, flushing buffered frames first.
  async fn shutdown(&mut self) -> Result<()>;
}

/// Reads newline-delimited JSON frames from a peer.
#[async_trait]
pub trait FrameDecoder: Send {
  /// Decodes the next frame; returns [`Frame::Eof`] at end of stream.
  async fn decode(&mut self) -> Result<Frame>;
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Buffered reading half of a peer connection.
pub struct FrameReader {
  inner: BufReader<BoxedRead>,
  line: Vec<u8>,
}

impl FrameReader {
  /// Wraps a raw reading half.
  pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
    Self {
      inner: BufReader::new(Box::new(reader)),
      line: Vec::new(),
    }
  }

  /// Reads a null-terminated handshake string: everything up to the first
  /// zero byte.
  pub async fn read_str(&mut self) -> Result<String> {
    self.line.clear();
    let n = self.inner.read_until(0, &mut self.line).await?;
    if n == 0 || self.line.last() != Some(&0) {
      return Err(
        std::io::Error::new(
          std::io::ErrorKind::UnexpectedEof,
          "connection closed during handshake",
        )
        .into(),
      );
    }
    self.line.pop();
    String::from_utf8(std::mem::take(&mut self.line)).map_err(|e| {
      std::io::Error::new(std::io::ErrorKind::InvalidData, e).into()
    })
  }

  /// Reads one JSON object, or `None` at a clean end of stream.
  pub async fn read_obj<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
    self.line.clear();
    let n = self.inner.read_until(b'\n', &mut self.line).await?;
    if n == 0 {
      return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&self.line)?))
  }

  /// Reads the next frame, mapping a clean end of stream to
  /// [`Frame::Eof`].
  pub async fn read_frame(&mut self) -> Result<Frame> {
    Ok(self.read_obj().await?.unwrap_or(Frame::Eof))
  }
}

#[async_trait]
impl FrameDecoder for FrameReader {
  async fn decode(&mut self) -> Result<Frame> {
    self.read_frame().await
  }
}

/// Writing half of a peer connection.
pub struct FrameWriter {
  inner: BoxedWrite,
}

impl FrameWriter {
  /// Wraps a raw writing half.
  pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
    Self {
      inner: Box::new(writer),
    }
  }

  /// Writes a handshake string followed by its zero terminator.
  pub async fn write_str(&mut self, s: &str) -> Result<()> {
    let mut buf = Vec::with_capacity(s.len() + 1);
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    self.inner.write_all(&buf).await?;
    self.inner.flush().await?;
    Ok(())
  }

  /// Writes one object as a newline-delimited JSON frame.
  pub async fn write_obj<T: Serialize>(&mut self, obj: &T) -> Result<()> {
    let mut buf = serde_json::to_vec(obj)?;
    buf.push(b'\n');
    let bytes = Bytes::from(buf);
    self.inner.write_all(&bytes).await?;
    self.inner.flush().await?;
    Ok(())
  }

  /// Writes one frame.
  pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
    self.write_obj(frame).await
  }

  /// Flushes and half-closes the writing side.
  pub async fn shutdown(&mut self) -> Result<()> {
    self.inner.shutdown().await?;
    Ok(())
  }
}

#[async_trait]
impl FrameEncoder for FrameWriter {
  async fn encode(&mut self, frame: Frame) -> Result<()> {
    self.write_frame(&frame).await
  }

  async fn shutdown(&mut self) -> Result<()> {
    FrameWriter::shutdown(self).await
  }
}

/// A bidirectional peer connection.
///
/// The halves are boxed so tests and custom dialers can substitute
/// in-memory transports for TCP.
pub struct Connection {
  reader: FrameReader,
  writer: FrameWriter,
}

impl std::fmt::Debug for Connection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connection").finish()
  }
}

impl Connection {
  /// Builds a connection from raw halves.
  pub fn new(
    reader: impl AsyncRead + Send + Unpin + 'static,
    writer: impl AsyncWrite + Send + Unpin + 'static,
  ) -> Self {
    Self {
      reader: FrameReader::new(reader),
      writer: FrameWriter::new(writer),
    }
  }

  /// Builds a connection from an established TCP stream.
  #[must_use]
  pub fn from_stream(stream: TcpStream) -> Self {
    let (reader, writer) = stream.into_split();
    Self::new(reader, writer)
  }

  /// Splits into independently owned halves, preserving buffered bytes.
  #[must_use]
  pub fn split(self) -> (FrameReader, FrameWriter) {
    (self.reader, self.writer)
  }

  /// See [`FrameReader::read_str`].
  pub async fn read_str(&mut self) -> Result<String> {
    self.reader.read_str().await
  }

  /// See [`FrameWriter::write_str`].
  pub async fn write_str(&mut self, s: &str) -> Result<()> {
    self.writer.write_str(s).await
  }

  /// See [`FrameReader::read_obj`].
  pub async fn read_obj<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
    self.reader.read_obj().await
  }

  /// See [`FrameWriter::write_obj`].
  pub async fn write_obj<T: Serialize>(&mut self, obj: &T) -> Result<()> {
    self.writer.write_obj(obj).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dataset::{Column, Dataset};

  #[tokio::test]
  async fn handshake_strings_round_trip() {
    let (client, server) = tokio::io::duplex(256);
    let (server_read, _server_write) = tokio::io::split(server);
    let (_client_read, client_write) = tokio::io::split(client);

    let mut writer = FrameWriter::new(client_write);
    let mut reader = FrameReader::new(server_read);

    writer.write_str("D").await.unwrap();
    writer.write_str("10.0.0.1:5551:some-uid").await.unwrap();

    assert_eq!(reader.read_str().await.unwrap(), "D");
    assert_eq!(reader.read_str().await.unwrap(), "10.0.0.1:5551:some-uid");
  }

  #[tokio::test]
  async fn read_str_fails_on_truncated_stream() {
    let (client, server) = tokio::io::duplex(256);
    let (server_read, _server_write) = tokio::io::split(server);
    let (_client_read, mut client_write) = tokio::io::split(client);

    tokio::io::AsyncWriteExt::write_all(&mut client_write, b"no-term")
      .await
      .unwrap();
    tokio::io::AsyncWriteExt::shutdown(&mut client_write)
      .await
      .unwrap();

    let mut reader = FrameReader::new(server_read);
    assert!(reader.read_str().await.is_err());
  }

  #[tokio::test]
  async fn frames_round_trip_and_eof_after_hangup() {
    let (client, server) = tokio::io::duplex(4096);
    let (server_read, _server_write) = tokio::io::split(server);
    let (_client_read, client_write) = tokio::io::split(client);

    let mut writer = FrameWriter::new(client_write);
    let mut reader = FrameReader::new(server_read);

    let data = Dataset::new(vec![Column::Strs(vec!["hello".into()])]);
    writer.write_frame(&Frame::Data(data.clone())).await.unwrap();
    writer
      .write_frame(&Frame::Error {
        message: "boom".into(),
      })
      .await
      .unwrap();
    writer.write_frame(&Frame::Eof).await.unwrap();
    writer.shutdown().await.unwrap();

    match reader.decode().await.unwrap() {
      Frame::Data(got) => assert_eq!(got, data),
      other => panic!("expected data frame, got {other:?}"),
    }
    match reader.decode().await.unwrap() {
      Frame::Error { message } => assert_eq!(message, "boom"),
      other => panic!("expected error frame, got {other:?}"),
    }
    assert!(matches!(reader.decode().await.unwrap(), Frame::Eof));
    // the stream is closed now; decode keeps yielding EOF
    assert!(matches!(reader.decode().await.unwrap(), Frame::Eof));
  }

  #[tokio::test]
  async fn split_preserves_buffered_bytes() {
    let (client, server) = tokio::io::duplex(4096);
    let (server_read, server_write) = tokio::io::split(server);
    let (_client_read, client_write) = tokio::io::split(client);

    let mut writer = FrameWriter::new(client_write);
    writer.write_str("D").await.unwrap();
    writer.write_frame(&Frame::Eof).await.unwrap();

    // the handshake read may buffer past the terminator; the frame must
    // survive the subsequent split
    let mut conn = Connection::new(server_read, server_write);
    assert_eq!(conn.read_str().await.unwrap(), "D");
    let (mut reader, _writer) = conn.split();
    assert!(matches!(reader.decode().await.unwrap(), Frame::Eof));
  }
}
