//! UDP identity broadcast and listener

use super::{DiscoveredPeer, PeerConnector, PeerTable};
use crate::connection::SessionRegistry;
use crate::{current_timestamp, DeviceInfo, Packet, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Largest datagram we accept
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Bind the discovery socket on all interfaces with broadcast enabled
pub async fn bind(port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

/// Parse and validate an identity announcement
pub fn parse_announcement(data: &[u8]) -> Result<DeviceInfo> {
    let identity = Packet::from_bytes(data)?.body_as::<DeviceInfo>()?;
    identity.validate()?;
    Ok(identity)
}

/// Send our identity once, then every `interval` unless it is zero
pub async fn broadcast(
    socket: Arc<UdpSocket>,
    identity: Arc<DeviceInfo>,
    target: SocketAddr,
    interval: Duration,
    cancel: CancellationToken,
) {
    let bytes = match Packet::from_body(identity.as_ref()).and_then(|p| p.to_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to encode identity for broadcast: {}", e);
            return;
        }
    };

    send_datagram(&socket, &bytes, target).await;
    if interval.is_zero() {
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => send_datagram(&socket, &bytes, target).await,
        }
    }
}

async fn send_datagram(socket: &UdpSocket, bytes: &[u8], target: SocketAddr) {
    match socket.send_to(bytes, target).await {
        Ok(_) => debug!("Broadcast identity ({} bytes) to {}", bytes.len(), target),
        Err(e) => warn!("Failed to broadcast identity to {}: {}", target, e),
    }
}

/// Receives announcements and starts session attempts
pub(crate) struct Listener {
    pub socket: Arc<UdpSocket>,
    pub local_device_id: String,
    pub registry: SessionRegistry,
    pub peers: PeerTable,
    pub connector: Arc<dyn PeerConnector>,
    pub tracker: TaskTracker,
}

impl Listener {
    pub async fn run(self, cancel: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((size, src)) => self.handle_datagram(&buf[..size], src, &cancel).await,
                Err(e) => {
                    // ICMP errors from earlier sends surface here on some platforms
                    debug!("Discovery receive failed: {}", e);
                }
            }
        }

        debug!("Discovery listener stopped");
    }

    async fn handle_datagram(&self, data: &[u8], src: SocketAddr, cancel: &CancellationToken) {
        let identity = match parse_announcement(data) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Ignoring malformed announcement from {}: {}", src, e);
                return;
            }
        };

        if identity.device_id == self.local_device_id {
            return;
        }

        let address = SocketAddr::new(src.ip(), identity.connect_port());
        info!(
            "Discovered {} ({}, {}) at {}",
            identity.device_name,
            identity.device_id,
            identity.device_type.as_str(),
            address
        );

        self.peers
            .record(DiscoveredPeer {
                identity: identity.clone(),
                address,
                last_seen: current_timestamp(),
            })
            .await;

        let attempt = self.registry.begin(&identity.device_id, cancel);
        let connector = self.connector.clone();
        self.tracker.spawn(async move {
            connector.connect(identity, address, attempt).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Attempt;
    use crate::discovery::{Discovery, DiscoveryConfig};
    use crate::DeviceType;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct RecordingConnector {
        attempts: mpsc::UnboundedSender<(DeviceInfo, SocketAddr, Attempt)>,
    }

    #[async_trait]
    impl PeerConnector for RecordingConnector {
        async fn connect(&self, peer: DeviceInfo, addr: SocketAddr, attempt: Attempt) {
            let cancel = attempt.cancel.clone();
            let _ = self.attempts.send((peer, addr, attempt));
            cancel.cancelled().await;
        }
    }

    fn announcement(device_id: &str, tcp_port: u16) -> Vec<u8> {
        let identity = DeviceInfo::new(device_id, "Phone", DeviceType::Phone, tcp_port);
        Packet::from_body(&identity).unwrap().to_bytes().unwrap()
    }

    async fn start_discovery(
        local_id: &str,
        broadcast_target: SocketAddr,
    ) -> (
        SocketAddr,
        mpsc::UnboundedReceiver<(DeviceInfo, SocketAddr, Attempt)>,
        PeerTable,
        CancellationToken,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peers = PeerTable::new();
        let discovery = Discovery::new(
            Arc::new(DeviceInfo::new(local_id, "Local", DeviceType::Desktop, 1716)),
            DiscoveryConfig {
                listen_port: 0,
                broadcast_target,
                broadcast_interval: Duration::ZERO,
                enable_mdns: false,
            },
            SessionRegistry::new(),
            peers.clone(),
            Arc::new(RecordingConnector { attempts: tx }),
            TaskTracker::new(),
        );
        let cancel = CancellationToken::new();
        let local = discovery.announce(&cancel).await.unwrap();
        let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), local.port());
        (addr, rx, peers, cancel)
    }

    #[test]
    fn test_parse_announcement() {
        let identity = parse_announcement(&announcement("phone_1", 1739)).unwrap();
        assert_eq!(identity.device_id, "phone_1");
        assert_eq!(identity.tcp_port, 1739);

        assert!(parse_announcement(b"{\"id\":1,\"type\":\"kdeconnect.ping\",\"body\":{}}").is_err());
        assert!(parse_announcement(b"garbage").is_err());
    }

    #[tokio::test]
    async fn test_broadcast_sends_identity() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();
        let (_addr, _rx, _peers, cancel) = start_discovery("local_id", target).await;

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (size, _) = tokio::time::timeout(Duration::from_secs(5), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parse_announcement(&buf[..size]).unwrap().device_id, "local_id");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_announcement_starts_attempt() {
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (addr, mut attempts, peers, cancel) =
            start_discovery("local_id", sink.local_addr().unwrap()).await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Garbage and our own announcement are ignored
        sender.send_to(b"not json", addr).await.unwrap();
        sender.send_to(&announcement("local_id", 1716), addr).await.unwrap();
        sender.send_to(&announcement("phone_1", 1739), addr).await.unwrap();

        let (peer, dial_addr, attempt) = attempts.recv().await.unwrap();
        assert_eq!(peer.device_id, "phone_1");
        assert_eq!(dial_addr, SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 1739));
        assert!(!attempt.cancel.is_cancelled());

        let seen = peers.get("phone_1").await.unwrap();
        assert_eq!(seen.address, dial_addr);

        cancel.cancel();
        assert!(attempt.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_repeated_announcement_supersedes_attempt() {
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (addr, mut attempts, _peers, cancel) =
            start_discovery("local_id", sink.local_addr().unwrap()).await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        sender.send_to(&announcement("phone_1", 1739), addr).await.unwrap();
        let (_, _, first) = attempts.recv().await.unwrap();

        sender.send_to(&announcement("phone_1", 1740), addr).await.unwrap();
        let (_, second_addr, second) = attempts.recv().await.unwrap();

        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());
        assert_eq!(second_addr.port(), 1740);
        cancel.cancel();
    }
}
