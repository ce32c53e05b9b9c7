//! Session Events
//!
//! Broadcast by the session layer for every state transition and close.

use crate::ProtocolError;
use std::fmt;

/// Session establishment and lifetime states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Dialing the peer
    Connecting,
    /// Plaintext identity line sent or received
    IdentityExchanged,
    /// TLS handshake completed
    TlsUpgraded,
    /// Peer certificate matches the pinned one
    Trusted,
    /// Unknown peer, waiting for a pairing request and decision
    Pairing,
    /// Plugins attached, packets flowing
    Active,
    /// Terminal
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::IdentityExchanged => "identity-exchanged",
            SessionState::TlsUpgraded => "tls-upgraded",
            SessionState::Trusted => "trusted",
            SessionState::Pairing => "pairing",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Shutdown, or superseded by a newer attempt for the same device
    Cancelled,
    /// The peer closed the connection
    PeerClosed,
    /// Unpaired by either side
    Unpaired,
    /// Pairing denied, superseded or refused by the peer
    PairingRejected,
    /// No pairing request or decision in time
    PairingTimedOut,
    /// The peer broke the protocol (includes certificate mismatch)
    ProtocolViolation(String),
    /// Transient failure (I/O, TLS, plugin)
    Error(String),
}

impl CloseReason {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CloseReason::ProtocolViolation(_) | CloseReason::Error(_)
        )
    }
}

impl From<&ProtocolError> for CloseReason {
    fn from(error: &ProtocolError) -> Self {
        match error {
            ProtocolError::Cancelled(_) => CloseReason::Cancelled,
            ProtocolError::ConnectionClosed => CloseReason::PeerClosed,
            ProtocolError::PairingRejected(_) => CloseReason::PairingRejected,
            ProtocolError::PairingTimeout(_) => CloseReason::PairingTimedOut,
            e if e.is_protocol_violation() => CloseReason::ProtocolViolation(e.to_string()),
            e => CloseReason::Error(e.to_string()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Cancelled => f.write_str("cancelled"),
            CloseReason::PeerClosed => f.write_str("closed by peer"),
            CloseReason::Unpaired => f.write_str("unpaired"),
            CloseReason::PairingRejected => f.write_str("pairing rejected"),
            CloseReason::PairingTimedOut => f.write_str("pairing timed out"),
            CloseReason::ProtocolViolation(detail) => write!(f, "protocol violation: {}", detail),
            CloseReason::Error(detail) => write!(f, "error: {}", detail),
        }
    }
}

/// Session event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session moved to a new state
    StateChanged {
        /// Peer device ID
        device_id: String,
        /// New state
        state: SessionState,
    },

    /// A session reached [`SessionState::Closed`]
    Closed {
        /// Peer device ID
        device_id: String,
        /// Why it ended
        reason: CloseReason,
    },
}

impl SessionEvent {
    pub fn device_id(&self) -> &str {
        match self {
            SessionEvent::StateChanged { device_id, .. } | SessionEvent::Closed { device_id, .. } => {
                device_id
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_from_error() {
        assert_eq!(
            CloseReason::from(&ProtocolError::Cancelled("x".into())),
            CloseReason::Cancelled
        );
        assert_eq!(
            CloseReason::from(&ProtocolError::PairingTimeout("alpha".into())),
            CloseReason::PairingTimedOut
        );
        assert!(matches!(
            CloseReason::from(&ProtocolError::CertificateMismatch("alpha".into())),
            CloseReason::ProtocolViolation(_)
        ));
        assert!(matches!(
            CloseReason::from(&ProtocolError::Timeout("dial".into())),
            CloseReason::Error(_)
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(SessionState::IdentityExchanged.to_string(), "identity-exchanged");
        assert_eq!(CloseReason::Unpaired.to_string(), "unpaired");
        assert!(!CloseReason::PairingRejected.is_error());
    }
}
