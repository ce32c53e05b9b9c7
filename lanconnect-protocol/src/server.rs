//! Server
//!
//! Owns everything shared between sessions and wires the pipeline together:
//!
//! ```text
//! UDP announcement ──▶ Discovery ──▶ outbound attempt ─┐
//!                                                      ├─▶ handshake ─▶ session loop
//! TCP listener ─────────────────────▶ inbound attempt ─┘
//! ```
//!
//! The control entry points ([`Server::pair`], [`Server::deny`],
//! [`Server::unpair`], [`Server::devices`], [`Server::ping`]) are what a local
//! control surface calls into.

use crate::connection::{
    establish_inbound, establish_outbound, Attempt, CloseReason, SessionCommand, SessionContext,
    SessionEvent, SessionTimeouts,
};
use crate::discovery::{self, Discovery, DiscoveryConfig, MdnsPeer, PeerConnector, PeerTable};
use crate::identity::validate_device_id;
use crate::pairing::PairingBroker;
use crate::plugins::clipboard::{ClipboardBackend, ClipboardPluginFactory};
use crate::plugins::ping::{PingPlugin, PingPluginFactory, PingStats};
use crate::plugins::PluginRegistry;
use crate::transport::TlsConfig;
use crate::trust::TrustStore;
use crate::{CertificateInfo, DeviceInfo, DeviceType, ProtocolError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server settings
#[derive(Clone)]
pub struct ServerConfig {
    /// Our identity; capabilities and TCP port are filled in by the server
    pub identity: DeviceInfo,
    /// TCP port to accept sessions on (0 picks a free one)
    pub tcp_port: u16,
    pub discovery: DiscoveryConfig,
    /// Run discovery when started
    pub enable_discovery: bool,
    pub timeouts: SessionTimeouts,
    /// How long [`Server::devices`] browses mDNS, zero to skip
    pub browse_timeout: Duration,
    pub enable_ping: bool,
    /// Clipboard backend, `None` disables clipboard sync
    pub clipboard: Option<Arc<dyn ClipboardBackend>>,
}

impl ServerConfig {
    pub fn new(identity: DeviceInfo) -> Self {
        Self {
            identity,
            tcp_port: crate::DEFAULT_PORT,
            discovery: DiscoveryConfig::default(),
            enable_discovery: true,
            timeouts: SessionTimeouts::default(),
            browse_timeout: Duration::from_secs(3),
            enable_ping: true,
            clipboard: None,
        }
    }
}

/// Result of [`Server::pair`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairOutcome {
    /// The device was already trusted, nothing to do
    AlreadyPaired,
    /// An outstanding request was approved
    Approved,
    /// The device did not ask to pair in time
    NoRequest,
}

/// How far along a known device is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceStatus {
    Discovered,
    Trusted,
    AwaitingPairing,
    Connected,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Discovered => "discovered",
            DeviceStatus::Trusted => "trusted",
            DeviceStatus::AwaitingPairing => "awaiting-pairing",
            DeviceStatus::Connected => "connected",
        }
    }
}

/// One entry of [`Server::devices`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub device_id: String,
    pub device_name: Option<String>,
    pub device_type: Option<DeviceType>,
    pub address: Option<SocketAddr>,
    pub status: DeviceStatus,
}

impl DeviceDescriptor {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            device_name: None,
            device_type: None,
            address: None,
            status: DeviceStatus::Discovered,
        }
    }

    fn raise(&mut self, status: DeviceStatus) {
        self.status = self.status.max(status);
    }
}

#[async_trait]
impl PeerConnector for SessionContext {
    async fn connect(&self, peer: DeviceInfo, addr: SocketAddr, attempt: Attempt) {
        establish_outbound(self, peer, addr, attempt).await;
    }
}

/// The daemon core
pub struct Server {
    ctx: SessionContext,
    config: ServerConfig,
    peers: PeerTable,
    ping: Option<Arc<PingPlugin>>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    discovery_addr: OnceLock<SocketAddr>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    /// Bind the TCP listener and assemble the session context
    pub async fn bind(
        config: ServerConfig,
        certificate: &CertificateInfo,
        trust: Arc<dyn TrustStore>,
        broker: PairingBroker,
    ) -> Result<Self> {
        if certificate.device_id != config.identity.device_id {
            warn!(
                "Certificate was issued for {}, identity is {}",
                certificate.device_id, config.identity.device_id
            );
        }

        let mut plugins = PluginRegistry::new();
        let ping = if config.enable_ping {
            let factory = PingPluginFactory::new();
            let plugin = factory.plugin();
            plugins.register_factory(Arc::new(factory))?;
            Some(plugin)
        } else {
            None
        };
        if let Some(backend) = &config.clipboard {
            plugins.register_factory(Arc::new(ClipboardPluginFactory::new(backend.clone())))?;
        }

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.tcp_port)).await?;
        let local_addr = listener.local_addr()?;

        let identity = config
            .identity
            .clone()
            .with_tcp_port(local_addr.port())
            .with_incoming_capabilities(plugins.incoming_capabilities())
            .with_outgoing_capabilities(plugins.outgoing_capabilities());

        info!(
            "Server for {} ({}) bound to {} with plugins {:?}",
            identity.device_name,
            identity.device_id,
            local_addr,
            plugins.list_plugins()
        );

        let ctx = SessionContext::new(
            identity,
            TlsConfig::new(certificate)?,
            trust,
            broker,
            plugins,
            config.timeouts,
        );

        Ok(Self {
            ctx,
            config,
            peers: PeerTable::new(),
            ping,
            listener: Mutex::new(Some(listener)),
            local_addr,
            discovery_addr: OnceLock::new(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Address the TCP listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address the discovery listener is bound to, once started
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery_addr.get().copied()
    }

    /// Our identity as announced to peers
    pub fn identity(&self) -> &DeviceInfo {
        &self.ctx.identity
    }

    pub fn broker(&self) -> &PairingBroker {
        &self.ctx.broker
    }

    pub fn trust_store(&self) -> &Arc<dyn TrustStore> {
        &self.ctx.trust
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx.subscribe()
    }

    /// Start accepting sessions and, if enabled, discovery
    ///
    /// Returns once everything is listening. Fails if discovery cannot bind
    /// its UDP socket or the server was already started.
    pub async fn start(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| std::io::Error::other("server already started"))?;

        if self.config.enable_discovery {
            let discovery = Discovery::new(
                self.ctx.identity.clone(),
                self.config.discovery.clone(),
                self.ctx.registry.clone(),
                self.peers.clone(),
                Arc::new(self.ctx.clone()),
                self.tracker.clone(),
            );
            let addr = discovery.announce(&self.cancel).await?;
            let _ = self.discovery_addr.set(addr);
        }

        self.tracker.spawn(accept_loop(
            listener,
            self.ctx.clone(),
            self.cancel.clone(),
            self.tracker.clone(),
        ));

        info!("Server started");
        Ok(())
    }

    /// Cancel every task and wait for them to finish
    pub async fn shutdown(&self) {
        info!("Shutting down server");
        self.cancel.cancel();
        self.ctx.registry.cancel_all();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Server stopped");
    }

    /// Dial a peer directly and run the session to completion
    pub async fn connect(&self, peer: DeviceInfo, addr: SocketAddr) -> Result<CloseReason> {
        peer.validate()?;
        let attempt = self.ctx.registry.begin(&peer.device_id, &self.cancel);
        Ok(establish_outbound(&self.ctx, peer, addr, attempt).await)
    }

    /// Approve pairing with `device_id`
    ///
    /// Waits up to the pairing timeout for the device to ask.
    pub async fn pair(&self, device_id: &str) -> Result<PairOutcome> {
        validate_device_id(device_id)?;

        if self.ctx.trust.contains(device_id).await? {
            return Ok(PairOutcome::AlreadyPaired);
        }

        let approved = self
            .ctx
            .broker
            .approve_when_requested(device_id, self.config.timeouts.pairing)
            .await;

        Ok(if approved {
            PairOutcome::Approved
        } else {
            PairOutcome::NoRequest
        })
    }

    /// Reject the outstanding pairing request of `device_id`
    pub fn deny(&self, device_id: &str) -> bool {
        self.ctx.broker.deny(device_id)
    }

    /// Forget `device_id` and close its session
    ///
    /// Returns whether a trust record existed.
    pub async fn unpair(&self, device_id: &str) -> Result<bool> {
        validate_device_id(device_id)?;
        let existed = self.ctx.trust.remove(device_id).await?;

        if let Some(commands) = self.ctx.registry.commands(device_id) {
            match commands.try_send(SessionCommand::Unpair) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // The session is backed up, close it without telling the peer
                    debug!("Session with {} is not draining, cancelling it", device_id);
                    self.ctx.registry.cancel(device_id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Session with {} ended before unpair", device_id);
                }
            }
        }

        Ok(existed)
    }

    /// Send a packet over the active session with `device_id`
    pub async fn send(&self, device_id: &str, packet: crate::Packet) -> Result<()> {
        let commands = self
            .ctx
            .registry
            .commands(device_id)
            .ok_or_else(|| ProtocolError::NotConnected(device_id.to_string()))?;

        commands
            .send(SessionCommand::Send(packet))
            .await
            .map_err(|_| ProtocolError::NotConnected(device_id.to_string()))
    }

    /// Ping `device_id`
    pub async fn ping(&self, device_id: &str, message: Option<String>) -> Result<()> {
        let plugin = self
            .ping
            .as_ref()
            .ok_or_else(|| ProtocolError::Plugin("ping is disabled".to_string()))?;

        if !self.ctx.registry.is_active(device_id) {
            return Err(ProtocolError::NotConnected(device_id.to_string()));
        }
        self.send(device_id, plugin.create_ping(message)?).await
    }

    pub fn ping_stats(&self) -> Option<PingStats> {
        self.ping.as_ref().map(|plugin| plugin.stats())
    }

    /// Everything we know about other devices
    pub async fn devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut devices: BTreeMap<String, DeviceDescriptor> = BTreeMap::new();

        for peer in self.peers.list().await {
            let entry = devices
                .entry(peer.identity.device_id.clone())
                .or_insert_with(|| DeviceDescriptor::new(&peer.identity.device_id));
            entry.device_name = Some(peer.identity.device_name);
            entry.device_type = Some(peer.identity.device_type);
            entry.address = Some(peer.address);
        }

        for peer in self.browse().await {
            devices
                .entry(peer.device_id.clone())
                .or_insert_with(|| DeviceDescriptor::new(&peer.device_id))
                .device_name
                .get_or_insert(peer.device_name);
        }

        for device_id in self.ctx.trust.list().await? {
            devices
                .entry(device_id.clone())
                .or_insert_with(|| DeviceDescriptor::new(&device_id))
                .raise(DeviceStatus::Trusted);
        }

        for request in self.ctx.broker.pending() {
            let entry = devices
                .entry(request.device_id.clone())
                .or_insert_with(|| DeviceDescriptor::new(&request.device_id));
            entry.device_name.get_or_insert(request.device_name);
            entry.raise(DeviceStatus::AwaitingPairing);
        }

        for device_id in self.ctx.registry.active_ids() {
            devices
                .entry(device_id.clone())
                .or_insert_with(|| DeviceDescriptor::new(&device_id))
                .raise(DeviceStatus::Connected);
        }

        Ok(devices.into_values().collect())
    }

    async fn browse(&self) -> Vec<MdnsPeer> {
        if !self.config.discovery.enable_mdns || self.config.browse_timeout.is_zero() {
            return Vec::new();
        }

        match discovery::browse(self.config.browse_timeout).await {
            Ok(peers) => peers
                .into_iter()
                .filter(|peer| peer.device_id != self.ctx.identity.device_id)
                .collect(),
            Err(e) => {
                warn!("mDNS browse failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// Source of inbound TCP connections
#[async_trait]
trait Acceptor: Send + Sync + 'static {
    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

async fn accept_loop<A: Acceptor>(
    listener: A,
    ctx: SessionContext,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Out of descriptors and the like, retrying at once would spin
                    warn!("Failed to accept connection: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                    }
                }
            },
        };

        debug!("Incoming connection from {}", remote_addr);
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", remote_addr, e);
        }

        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            if let Err(e) = establish_inbound(&ctx, stream, remote_addr, &cancel).await {
                if e.is_protocol_violation() {
                    warn!("Dropping connection from {}: {}", remote_addr, e);
                } else {
                    debug!("Connection from {} failed: {}", remote_addr, e);
                }
            }
        });
    }

    debug!("TCP listener stopped");
}
