//! Pairing Event System
//!
//! Events published by the [`PairingBroker`](super::PairingBroker).

use super::PairingDecision;

/// Events emitted by the pairing broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// A device asked to pair and is waiting for a decision
    RequestReceived {
        /// ID of the device requesting pairing
        device_id: String,
        /// Name of the device requesting pairing
        device_name: String,
        /// Certificate fingerprint for user verification
        fingerprint: String,
    },

    /// A decision was delivered to a waiting request
    Decided {
        /// ID of the device
        device_id: String,
        /// The decision
        decision: PairingDecision,
    },

    /// A request went away without a decision (timeout, disconnect)
    Withdrawn {
        /// ID of the device
        device_id: String,
    },
}

impl PairingEvent {
    /// Check if this is a request received event
    pub fn is_request_received(&self) -> bool {
        matches!(self, PairingEvent::RequestReceived { .. })
    }

    /// Device this event is about
    pub fn device_id(&self) -> &str {
        match self {
            PairingEvent::RequestReceived { device_id, .. } => device_id,
            PairingEvent::Decided { device_id, .. } => device_id,
            PairingEvent::Withdrawn { device_id } => device_id,
        }
    }
}
