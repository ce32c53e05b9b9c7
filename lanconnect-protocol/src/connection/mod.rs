//! Session Establishment and Session Loop
//!
//! Per-peer state machine:
//!
//! ```text
//! Connecting → IdentityExchanged → TlsUpgraded → Trusted ─┬→ Active → Closed
//!                                              ↘ Pairing ─┘
//! ```
//!
//! - [`handshake`]: dial/accept, identity line, TLS upgrade, trust decision
//!   and pairing
//! - [`session`]: the reader task and the loop owning the write half
//! - [`registry`]: per-device supersede table and session commands
//! - [`events`]: state transitions broadcast to observers
//!
//! Every error ends the session it occurred in and nothing else.

pub mod events;
pub mod handshake;
pub mod registry;
pub mod session;

pub use events::{CloseReason, SessionEvent, SessionState};
pub use handshake::{establish_inbound, establish_outbound};
pub use registry::{Attempt, SessionCommand, SessionRegistry};

use crate::pairing::{PairingBroker, PAIRING_TIMEOUT};
use crate::plugins::PluginRegistry;
use crate::transport::TlsConfig;
use crate::trust::TrustStore;
use crate::DeviceInfo;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the session event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Time limits applied during establishment
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    /// TCP dial
    pub connect: Duration,
    /// Identity line and TLS handshake
    pub handshake: Duration,
    /// Waiting for the peer's pair request, then for a decision
    pub pairing: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            handshake: Duration::from_secs(10),
            pairing: PAIRING_TIMEOUT,
        }
    }
}

/// Everything a session needs, passed explicitly to every attempt
#[derive(Clone)]
pub struct SessionContext {
    /// Our identity
    pub identity: Arc<DeviceInfo>,
    pub tls: Arc<TlsConfig>,
    pub trust: Arc<dyn TrustStore>,
    pub broker: PairingBroker,
    pub plugins: Arc<PluginRegistry>,
    pub registry: SessionRegistry,
    pub events: broadcast::Sender<SessionEvent>,
    pub timeouts: SessionTimeouts,
}

impl SessionContext {
    pub fn new(
        identity: DeviceInfo,
        tls: TlsConfig,
        trust: Arc<dyn TrustStore>,
        broker: PairingBroker,
        plugins: PluginRegistry,
        timeouts: SessionTimeouts,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            identity: Arc::new(identity),
            tls: Arc::new(tls),
            trust,
            broker,
            plugins: Arc::new(plugins),
            registry: SessionRegistry::new(),
            events,
            timeouts,
        }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn set_state(&self, device_id: &str, state: SessionState) {
        debug!("Session {} → {}", device_id, state);
        let _ = self.events.send(SessionEvent::StateChanged {
            device_id: device_id.to_string(),
            state,
        });
    }

    pub(crate) fn closed(&self, device_id: &str, reason: CloseReason) {
        self.set_state(device_id, SessionState::Closed);
        let _ = self.events.send(SessionEvent::Closed {
            device_id: device_id.to_string(),
            reason,
        });
    }
}
