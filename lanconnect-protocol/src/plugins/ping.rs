//! Ping Plugin
//!
//! Answers every `kdeconnect.ping` with a `{"message":"pong"}` reply.
//!
//! ```json
//! {
//!     "id": 1234567890,
//!     "type": "kdeconnect.ping",
//!     "body": {
//!         "message": "hello"
//!     }
//! }
//! ```
//!
//! The `message` field is optional. A ping whose message is already `"pong"`
//! is not answered, so two daemons never bounce replies forever.

use super::{Plugin, PluginContext, PluginFactory};
use crate::packet::{PacketBody, PACKET_TYPE_PING};
use crate::{Packet, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Message carried by ping replies
pub const PONG: &str = "pong";

/// Ping packet body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PingBody {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }

    /// Whether this ping is itself a reply
    pub fn is_pong(&self) -> bool {
        self.message.as_deref() == Some(PONG)
    }
}

impl PacketBody for PingBody {
    const TYPE: &'static str = PACKET_TYPE_PING;
}

/// Counters shared by every session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingStats {
    pub pings_received: u64,
    pub pings_sent: u64,
}

/// Stateless ping responder
#[derive(Debug, Default)]
pub struct PingPlugin {
    pings_received: AtomicU64,
    pings_sent: AtomicU64,
}

impl PingPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an outgoing ping and count it
    pub fn create_ping(&self, message: Option<String>) -> Result<Packet> {
        let packet = Packet::from_body(&PingBody { message })?;
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
        Ok(packet)
    }

    pub fn stats(&self) -> PingStats {
        PingStats {
            pings_received: self.pings_received.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Plugin for PingPlugin {
    fn name(&self) -> &str {
        "ping"
    }

    async fn handle_packet(&self, packet: &Packet) -> Result<Option<Packet>> {
        // Some clients omit the body entirely
        let ping = if packet.body().is_null() && packet.is_type(PACKET_TYPE_PING) {
            PingBody::default()
        } else {
            packet.body_as::<PingBody>()?
        };
        self.pings_received.fetch_add(1, Ordering::Relaxed);

        if ping.is_pong() {
            debug!("Received pong");
            return Ok(None);
        }

        match ping.message.as_deref() {
            Some(message) => info!("Received ping: {}", message),
            None => info!("Received ping"),
        }

        Ok(Some(self.create_ping(Some(PONG.to_string()))?))
    }
}

/// Hands the same [`PingPlugin`] to every session
#[derive(Debug, Default)]
pub struct PingPluginFactory {
    plugin: Arc<PingPlugin>,
}

impl PingPluginFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared plugin, for stats and outgoing pings
    pub fn plugin(&self) -> Arc<PingPlugin> {
        self.plugin.clone()
    }
}

impl PluginFactory for PingPluginFactory {
    fn name(&self) -> &str {
        "ping"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_PING.to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_PING.to_string()]
    }

    fn create(&self, _context: &PluginContext) -> Result<Arc<dyn Plugin>> {
        Ok(self.plugin.clone())
    }
}
