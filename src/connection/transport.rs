//! Transport Boundary
//!
//! The pipeline treats the transport as an opaque byte stream. A [`Connector`]
//! produces a fresh stream for the initial connection and for every reconnect
//! attempt; end-of-stream and I/O errors are the "disconnected" signal.

use std::future::Future;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Establishes byte streams to the server.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Human-readable peer description for logs.
    fn describe(&self) -> String;
}

/// Plain TCP to `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self) -> impl Future<Output = io::Result<TcpStream>> + Send {
        let addr = self.addr.clone();
        async move {
            let stream = TcpStream::connect(&addr).await?;
            // Pipelined requests are small; don't let Nagle hold them back.
            stream.set_nodelay(true)?;
            Ok(stream)
        }
    }

    fn describe(&self) -> String {
        self.addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"+PONG\r\n").await.unwrap();
        });

        let connector = TcpConnector::new(addr.to_string());
        assert_eq!(connector.describe(), addr.to_string());

        let mut stream = connector.connect().await.unwrap();
        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let connector = TcpConnector::new(addr.to_string());
        assert!(connector.connect().await.is_err());
    }
}
