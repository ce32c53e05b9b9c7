//! Device Discovery
//!
//! Two independent announcers run side by side until cancelled:
//!
//! - [`udp`]: identity packets broadcast on UDP port 1716, and a listener
//!   turning every received announcement into a session attempt
//! - [`mdns`]: a `_kdeconnect._udp.local.` service advertisement
//!
//! ## Deduplication
//!
//! Every announcement starts a fresh attempt through the
//! [`SessionRegistry`], which cancels any attempt or session still
//! registered for the same device id (the peer may have restarted).
//! Cancelling discovery cancels every attempt it started.

pub mod mdns;
pub mod udp;

use crate::connection::{Attempt, SessionRegistry};
use crate::{DeviceInfo, Result, DEFAULT_PORT};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

pub use mdns::{browse, MdnsAdvertiser, MdnsPeer, SERVICE_TYPE};

/// Default UDP port for device discovery
pub const DISCOVERY_PORT: u16 = DEFAULT_PORT;

/// Broadcast address for IPv4
pub const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::BROADCAST;

/// Starts a session with a discovered peer
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    /// Run one establishment attempt to completion
    async fn connect(&self, peer: DeviceInfo, addr: SocketAddr, attempt: Attempt);
}

/// Discovery settings
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Local UDP port to listen on
    pub listen_port: u16,
    /// Where our identity is broadcast
    pub broadcast_target: SocketAddr,
    /// Re-broadcast period, zero to announce once
    pub broadcast_interval: Duration,
    /// Advertise over mDNS as well
    pub enable_mdns: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            listen_port: DISCOVERY_PORT,
            broadcast_target: SocketAddr::new(IpAddr::V4(BROADCAST_ADDR), DISCOVERY_PORT),
            broadcast_interval: Duration::ZERO,
            enable_mdns: true,
        }
    }
}

/// A peer seen on the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub identity: DeviceInfo,
    /// Address we dial (announcement source IP, advertised port)
    pub address: SocketAddr,
    /// UNIX millis of the last announcement
    pub last_seen: i64,
}

/// Last announcement per device id
#[derive(Clone, Default)]
pub struct PeerTable {
    peers: Arc<RwLock<HashMap<String, DiscoveredPeer>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, peer: DiscoveredPeer) {
        self.peers
            .write()
            .await
            .insert(peer.identity.device_id.clone(), peer);
    }

    pub async fn get(&self, device_id: &str) -> Option<DiscoveredPeer> {
        self.peers.read().await.get(device_id).cloned()
    }

    /// All peers, ordered by device id
    pub async fn list(&self) -> Vec<DiscoveredPeer> {
        let mut peers: Vec<_> = self.peers.read().await.values().cloned().collect();
        peers.sort_by(|a, b| a.identity.device_id.cmp(&b.identity.device_id));
        peers
    }
}

/// Announces this device and reacts to peer announcements
pub struct Discovery {
    identity: Arc<DeviceInfo>,
    config: DiscoveryConfig,
    registry: SessionRegistry,
    peers: PeerTable,
    connector: Arc<dyn PeerConnector>,
    tracker: TaskTracker,
}

impl Discovery {
    pub fn new(
        identity: Arc<DeviceInfo>,
        config: DiscoveryConfig,
        registry: SessionRegistry,
        peers: PeerTable,
        connector: Arc<dyn PeerConnector>,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            identity,
            config,
            registry,
            peers,
            connector,
            tracker,
        }
    }

    /// Start the UDP listener, the broadcaster and the mDNS advertiser
    ///
    /// Returns once the UDP socket is bound; everything else runs on the
    /// task tracker until `cancel` fires. Failing to bind is fatal, a
    /// failing mDNS advertisement is not.
    pub async fn announce(&self, cancel: &CancellationToken) -> Result<SocketAddr> {
        let socket = Arc::new(udp::bind(self.config.listen_port).await?);
        let local_addr = socket.local_addr()?;
        info!("Discovery listening on UDP {}", local_addr);

        let listener = udp::Listener {
            socket: socket.clone(),
            local_device_id: self.identity.device_id.clone(),
            registry: self.registry.clone(),
            peers: self.peers.clone(),
            connector: self.connector.clone(),
            tracker: self.tracker.clone(),
        };
        self.tracker.spawn(listener.run(cancel.clone()));

        self.tracker.spawn(udp::broadcast(
            socket,
            self.identity.clone(),
            self.config.broadcast_target,
            self.config.broadcast_interval,
            cancel.clone(),
        ));

        if self.config.enable_mdns {
            match MdnsAdvertiser::start(&self.identity, local_addr.port()) {
                Ok(advertiser) => {
                    let cancel = cancel.clone();
                    self.tracker.spawn(async move {
                        cancel.cancelled().await;
                        advertiser.stop().await;
                    });
                }
                Err(e) => warn!("mDNS advertisement unavailable: {}", e),
            }
        }

        Ok(local_addr)
    }
}
