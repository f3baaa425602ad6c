//! TCP connection support
//!
//! Graceful close sends a FIN after flushing. Abort sets `SO_LINGER` to zero
//! so the peer observes a reset once both halves are released.

use crate::connection::{ChunkWriter, Connection, IoReader};
use async_trait::async_trait;
use bytes::Bytes;
use socket2::SockRef;
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// Write half of a relayed TCP connection
#[derive(Debug)]
pub struct TcpWriter {
    half: Option<OwnedWriteHalf>,
}

impl TcpWriter {
    pub fn new(half: OwnedWriteHalf) -> Self {
        Self { half: Some(half) }
    }

    fn half(&mut self) -> io::Result<&mut OwnedWriteHalf> {
        self.half
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "TCP write half aborted"))
    }
}

#[async_trait]
impl ChunkWriter for TcpWriter {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        let half = self.half()?;
        half.write_all(&chunk).await?;
        half.flush().await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.half()?.flush().await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.half()?.shutdown().await
    }

    fn abort(&mut self) {
        if let Some(half) = self.half.take() {
            let stream: &TcpStream = half.as_ref();
            if let Err(e) = SockRef::from(stream).set_linger(Some(Duration::ZERO)) {
                debug!("Failed to set SO_LINGER before abort: {}", e);
            }
            // Skip the FIN that dropping the half would send; the socket is
            // closed (and reset) when the read half is dropped.
            half.forget();
        }
    }
}

impl Connection for TcpStream {
    type Reader = IoReader<OwnedReadHalf>;
    type Writer = TcpWriter;

    fn describe(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "tcp".to_string(),
        }
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (read, write) = self.into_split();
        (IoReader::new(read), TcpWriter::new(write))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChunkReader;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_describe_uses_peer_addr() {
        let (client, server) = connected_pair().await;
        assert_eq!(server.describe(), client.local_addr().unwrap().to_string());
    }

    #[tokio::test]
    async fn test_shutdown_sends_fin() {
        let (mut client, server) = connected_pair().await;
        let (_reader, mut writer) = Connection::split(server);

        writer.write_chunk(Bytes::from_static(b"bye")).await.unwrap();
        writer.shutdown().await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");
    }

    #[tokio::test]
    async fn test_write_after_abort_fails() {
        let (_client, server) = connected_pair().await;
        let (_reader, mut writer) = Connection::split(server);

        writer.abort();
        let err = writer
            .write_chunk(Bytes::from_static(b"late"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_read_chunk_from_tcp() {
        let (mut client, server) = connected_pair().await;
        let (mut reader, _writer) = Connection::split(server);

        client.write_all(b"ping").await.unwrap();
        let chunk = reader.read_chunk(1024).await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"ping");
    }
}
