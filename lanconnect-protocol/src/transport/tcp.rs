//! Plaintext TCP Bootstrap
//!
//! Every connection starts as plain TCP carrying exactly one line: the
//! identity packet of the side that dialed. The TLS upgrade follows
//! immediately, so nothing may be read past that line.

use super::framing::{read_line_unbuffered, write_packet};
use crate::identity::DeviceInfo;
use crate::{Packet, ProtocolError, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Maximum size of the plaintext identity line
const MAX_IDENTITY_SIZE: usize = 64 * 1024;

/// TCP connection before the TLS upgrade
pub struct TcpConnection {
    stream: TcpStream,
    remote_addr: SocketAddr,
}

impl TcpConnection {
    /// Dial a remote device, bounded by `connect_timeout` and `cancel`
    pub async fn connect(
        addr: SocketAddr,
        connect_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        debug!("Connecting to {}", addr);

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ProtocolError::Cancelled(format!("connecting to {}", addr)));
            }
            result = tokio::time::timeout(connect_timeout, TcpStream::connect(addr)) => {
                result.map_err(|_| ProtocolError::timeout(format!("connecting to {}", addr)))??
            }
        };
        stream.set_nodelay(true)?;

        debug!("Connected to {}", addr);

        Ok(Self {
            stream,
            remote_addr: addr,
        })
    }

    /// Wrap an accepted stream
    pub fn from_stream(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        Self {
            stream,
            remote_addr,
        }
    }

    /// Get remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Write our identity line
    pub async fn send_identity(&mut self, identity: &DeviceInfo) -> Result<()> {
        let packet = Packet::from_body(identity)?;
        write_packet(&mut self.stream, &packet).await?;
        debug!("Sent plaintext identity to {}", self.remote_addr);
        Ok(())
    }

    /// Read the peer's identity line, bounded by `read_timeout` and `cancel`
    ///
    /// Reads byte by byte so the TLS handshake bytes that follow stay in
    /// the socket.
    pub async fn receive_identity(
        &mut self,
        read_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<DeviceInfo> {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ProtocolError::Cancelled(format!("reading identity from {}", self.remote_addr)));
            }
            result = tokio::time::timeout(
                read_timeout,
                read_line_unbuffered(&mut self.stream, MAX_IDENTITY_SIZE),
            ) => {
                result.map_err(|_| ProtocolError::timeout(format!("reading identity from {}", self.remote_addr)))??
            }
        };

        let line = line.ok_or(ProtocolError::ConnectionClosed)?;
        let identity = Packet::from_bytes(&line)?.body_as::<DeviceInfo>()?;
        identity.validate()?;

        debug!(
            "Received plaintext identity of {} ({}) from {}",
            identity.device_name, identity.device_id, self.remote_addr
        );
        Ok(identity)
    }

    /// Hand the socket over to the TLS layer
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceType;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_identity_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (stream, remote_addr) = listener.accept().await.unwrap();
            let mut conn = TcpConnection::from_stream(stream, remote_addr);
            conn.receive_identity(Duration::from_secs(5), &CancellationToken::new())
                .await
                .unwrap()
        });

        let identity = DeviceInfo::new("dialer", "Dialer", DeviceType::Laptop, 1716);
        let mut client = TcpConnection::connect(addr, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        client.send_identity(&identity).await.unwrap();

        assert_eq!(server_task.await.unwrap(), identity);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result =
            TcpConnection::connect(addr, Duration::from_secs(5), &CancellationToken::new()).await;
        assert!(matches!(result, Err(ProtocolError::Io(_))));
    }

    #[tokio::test]
    async fn test_connect_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let addr: SocketAddr = "10.255.255.1:1716".parse().unwrap();
        let result = TcpConnection::connect(addr, Duration::from_secs(5), &cancel).await;
        assert!(matches!(result, Err(ProtocolError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_non_identity_line_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_task = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"{\"id\":1,\"type\":\"kdeconnect.ping\",\"body\":{}}\n")
                .await
                .unwrap();
            stream
        });

        let (stream, remote_addr) = listener.accept().await.unwrap();
        let mut conn = TcpConnection::from_stream(stream, remote_addr);
        let result = conn
            .receive_identity(Duration::from_secs(5), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ProtocolError::PacketTypeMismatch { .. })));
        drop(client_task.await.unwrap());
    }
}
