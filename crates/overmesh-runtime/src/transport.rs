//! Transport abstraction
//!
//! A [`Transport`] is a raw byte channel beneath one connection: frames go
//! out, chunks come in, and a clean shutdown is distinguishable from a
//! fault. TCP is the production implementation; the in-memory duplex pair
//! backs deterministic tests. A TLS session wraps the TCP stream at
//! construction time and is otherwise invisible to this layer.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use overmesh_core::TransportError;

/// Read buffer size for stream transports.
const READ_CHUNK: usize = 8 * 1024;

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// A connected raw byte channel.
#[async_trait]
pub trait Transport: Send {
    /// Write bytes to the peer
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read the next chunk of bytes. `Ok(None)` signals a clean shutdown by
    /// the peer. Must be cancel-safe: a cancelled call loses no data.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Shut the channel down
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Human-readable endpoint description for logs
    fn description(&self) -> String;
}

// ----------------------------------------------------------------------------
// TCP Transport
// ----------------------------------------------------------------------------

/// A transport over one TCP stream.
pub struct TcpTransport {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    /// Wrap an accepted or connected stream
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        TcpTransport { stream, peer }
    }

    /// Dial the given address with a connect deadline
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, TransportError> {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(TcpTransport::new(stream)),
            Ok(Err(error)) => Err(TransportError::Io(error)),
            Err(_) => Err(TransportError::ConnectTimeout(timeout)),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut buf = vec![0u8; READ_CHUNK];
        let read = self.stream.read(&mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        buf.truncate(read);
        Ok(Some(buf))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn description(&self) -> String {
        match self.peer {
            Some(addr) => format!("tcp://{addr}"),
            None => "tcp://unknown".to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// In-Memory Transport
// ----------------------------------------------------------------------------

/// One end of an in-memory transport pair.
pub struct DuplexTransport {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    rx: mpsc::Receiver<Vec<u8>>,
    label: &'static str,
}

/// Create a connected in-memory transport pair for tests and loopback.
pub fn duplex_pair(capacity: usize) -> (DuplexTransport, DuplexTransport) {
    let (left_tx, left_rx) = mpsc::channel(capacity);
    let (right_tx, right_rx) = mpsc::channel(capacity);
    (
        DuplexTransport {
            tx: Some(left_tx),
            rx: right_rx,
            label: "duplex://a",
        },
        DuplexTransport {
            tx: Some(right_tx),
            rx: left_rx,
            label: "duplex://b",
        },
    )
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx
                .send(bytes.to_vec())
                .await
                .map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }

    fn description(&self) -> String {
        self.label.to_string()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_pair_carries_bytes_both_ways() {
        let (mut a, mut b) = duplex_pair(8);

        a.send(b"to b").await.unwrap();
        b.send(b"to a").await.unwrap();

        assert_eq!(b.recv().await.unwrap().unwrap(), b"to b");
        assert_eq!(a.recv().await.unwrap().unwrap(), b"to a");
    }

    #[tokio::test]
    async fn test_duplex_close_is_clean_eof_for_peer() {
        let (mut a, mut b) = duplex_pair(8);

        a.close().await.unwrap();
        assert!(b.recv().await.unwrap().is_none());
        assert!(matches!(a.send(b"late").await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_tcp_transport_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            TcpTransport::new(stream)
        });

        let mut client = TcpTransport::connect(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap();
        let mut server = accept.await.unwrap();

        client.send(b"ping").await.unwrap();
        let chunk = server.recv().await.unwrap().unwrap();
        assert_eq!(chunk, b"ping");

        client.close().await.unwrap();
        assert!(server.recv().await.unwrap().is_none());
    }
}
