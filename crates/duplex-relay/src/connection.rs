//! Connection capability consumed by the relay
//!
//! A connection is any reliable, ordered byte pipe. The relay splits it into
//! a read half and a write half so each direction can be driven
//! independently; the write half is only ever used by one writer.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Read half of a connection
#[async_trait]
pub trait ChunkReader: Send {
    /// Read the next chunk of at most `max_len` bytes
    ///
    /// Returns `None` on clean end-of-stream.
    async fn read_chunk(&mut self, max_len: usize) -> io::Result<Option<Bytes>>;
}

/// Write half of a connection
#[async_trait]
pub trait ChunkWriter: Send {
    /// Hand a whole chunk to the transport
    ///
    /// Completes only once the transport accepted every byte, so awaiting it
    /// is how a full outbound buffer pushes back on the relay.
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()>;

    /// Flush buffered bytes without sending new data
    async fn flush(&mut self) -> io::Result<()>;

    /// Flush, then close the write direction
    async fn shutdown(&mut self) -> io::Result<()>;

    /// Close immediately, discarding anything not yet sent
    fn abort(&mut self) {}
}

/// An open byte-stream connection that can be relayed
pub trait Connection: Send + 'static {
    type Reader: ChunkReader + 'static;
    type Writer: ChunkWriter + 'static;

    /// Human-readable label for logs (usually the peer address)
    fn describe(&self) -> String {
        "connection".to_string()
    }

    /// Split into independently owned read and write halves
    fn split(self) -> (Self::Reader, Self::Writer);
}

/// Chunk reader over any `AsyncRead`
#[derive(Debug)]
pub struct IoReader<R> {
    inner: R,
}

impl<R> IoReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R> ChunkReader for IoReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_chunk(&mut self, max_len: usize) -> io::Result<Option<Bytes>> {
        let mut buffer = BytesMut::with_capacity(max_len);
        let n = self.inner.read_buf(&mut buffer).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buffer.freeze()))
    }
}

/// Chunk writer over any `AsyncWrite`
#[derive(Debug)]
pub struct IoWriter<W> {
    inner: W,
}

impl<W> IoWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W> ChunkWriter for IoWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.inner.write_all(&chunk).await?;
        self.inner.flush().await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Connection over any `AsyncRead + AsyncWrite` stream
///
/// Covers TLS-wrapped streams and in-memory pipes. Abort simply drops the
/// stream; use the `TcpStream` implementation when a reset is needed.
#[derive(Debug)]
pub struct StreamConnection<T> {
    io: T,
    label: String,
}

impl<T> StreamConnection<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(io: T) -> Self {
        Self {
            io,
            label: "stream".to_string(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

impl<T> Connection for StreamConnection<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    type Reader = IoReader<ReadHalf<T>>;
    type Writer = IoWriter<WriteHalf<T>>;

    fn describe(&self) -> String {
        self.label.clone()
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (read, write) = tokio::io::split(self.io);
        (IoReader::new(read), IoWriter::new(write))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_io_reader_respects_max_len() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (mut reader, _writer) = StreamConnection::new(server).split();

        client.write_all(b"hello world").await.unwrap();

        let chunk = reader.read_chunk(5).await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hello");
        let chunk = reader.read_chunk(64).await.unwrap().unwrap();
        assert_eq!(&chunk[..], b" world");
    }

    #[tokio::test]
    async fn test_io_reader_eof() {
        let (client, server) = tokio::io::duplex(64);
        let (mut reader, _writer) = StreamConnection::new(server).split();

        drop(client);
        assert!(reader.read_chunk(64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_io_writer_shutdown_signals_eof() {
        let (mut client, server) = tokio::io::duplex(64);
        let (_reader, mut writer) = StreamConnection::new(server).split();

        writer.write_chunk(Bytes::from_static(b"data")).await.unwrap();
        writer.shutdown().await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"data");
    }

    #[test]
    fn test_stream_connection_label() {
        let (_client, server) = tokio::io::duplex(64);
        let conn = StreamConnection::new(server).with_label("ingress");
        assert_eq!(conn.describe(), "ingress");
    }
}
