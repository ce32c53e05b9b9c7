//! Error handling for the lanconnect protocol
//!
//! All fallible operations in this crate return [`Result`], whose error type
//! [`ProtocolError`] is converted automatically from the underlying library
//! errors using `thiserror`.
//!
//! ## Error Categories
//!
//! ### Transient I/O
//! Socket resets, timeouts and refused connections. Fatal to the session they
//! occur in, never to the process.
//!
//! ### Protocol violations
//! Malformed envelopes, unexpected packet types and certificate mismatches.
//! Sessions drop these silently and log them at `warn` level, see
//! [`ProtocolError::is_protocol_violation`].
//!
//! ### Pairing outcomes
//! `PairingRejected` and `PairingTimeout` are ordinary negative results of a
//! pairing attempt rather than faults.
//!
//! ```rust
//! use lanconnect_protocol::ProtocolError;
//!
//! let error = ProtocolError::CertificateMismatch("phone".to_string());
//! assert!(error.is_protocol_violation());
//! ```

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
///
/// # Automatic Conversions
///
/// - `std::io::Error` → `ProtocolError::Io`
/// - `serde_json::Error` → `ProtocolError::Json`
/// - `openssl::ssl::Error` → `ProtocolError::Tls`
/// - `openssl::error::ErrorStack` → `ProtocolError::Certificate`
/// - `mdns_sd::Error` → `ProtocolError::Mdns`
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS handshake or stream error
    #[error("TLS error: {0}")]
    Tls(#[from] openssl::ssl::Error),

    /// Certificate generation, parsing or OpenSSL setup error
    #[error("Certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    /// Service discovery (mDNS) error
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),

    /// Certificate could not be decoded or configured
    #[error("Certificate validation error: {0}")]
    CertificateValidation(String),

    /// The peer presented a certificate that differs from the pinned one
    ///
    /// Raised during the trust decision of a handshake. The connection is
    /// dropped without any reply.
    #[error("Certificate mismatch for device {0}")]
    CertificateMismatch(String),

    /// Peer did not present a client certificate
    #[error("No peer certificate presented")]
    MissingPeerCertificate,

    /// Invalid or malformed packet
    ///
    /// ```rust
    /// use lanconnect_protocol::ProtocolError;
    ///
    /// let error = ProtocolError::InvalidPacket("missing type field".to_string());
    /// assert_eq!(error.to_string(), "Invalid packet: missing type field");
    /// ```
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// A typed body was requested from an envelope carrying another tag
    #[error("Packet type mismatch: expected {expected}, got {actual}")]
    PacketTypeMismatch {
        /// Tag declared by the requested body type
        expected: &'static str,
        /// Tag carried by the envelope
        actual: String,
    },

    /// A packet arrived that is not valid in the current session state
    #[error("Unexpected packet: {0}")]
    UnexpectedPacket(String),

    /// Packet size exceeded
    #[error("Packet size exceeded: {0} bytes (max: {1})")]
    PacketSizeExceeded(usize, usize),

    /// The remote closed the connection
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Pairing request was denied (locally or by the peer)
    #[error("Pairing rejected: {0}")]
    PairingRejected(String),

    /// No pairing decision was made in time
    #[error("Pairing timed out: {0}")]
    PairingTimeout(String),

    /// Device is not paired
    #[error("Not paired")]
    NotPaired,

    /// Device has no active session
    #[error("Device not connected: {0}")]
    NotConnected(String),

    /// Device id cannot be used (empty or contains path separators)
    #[error("Invalid device id: {0:?}")]
    InvalidDeviceId(String),

    /// Trust store failure
    #[error("Trust store error: {0}")]
    TrustStore(String),

    /// Plugin-specific error
    ///
    /// ```rust
    /// use lanconnect_protocol::ProtocolError;
    ///
    /// let error = ProtocolError::Plugin("clipboard watcher died".to_string());
    /// assert_eq!(error.to_string(), "Plugin error: clipboard watcher died");
    /// ```
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Connection timeout
    #[error("Connection timeout: {0}")]
    Timeout(String),

    /// Operation cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl ProtocolError {
    /// Whether this error means the peer broke the protocol
    ///
    /// Violations are logged at `warn` level and the connection is dropped
    /// without a reply. Everything else is treated as transient.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidPacket(_)
                | ProtocolError::PacketTypeMismatch { .. }
                | ProtocolError::UnexpectedPacket(_)
                | ProtocolError::PacketSizeExceeded(..)
                | ProtocolError::CertificateMismatch(_)
                | ProtocolError::MissingPeerCertificate
                | ProtocolError::Json(_)
        )
    }

    /// Whether this error is an expected outcome of a pairing attempt
    pub fn is_pairing_outcome(&self) -> bool {
        matches!(
            self,
            ProtocolError::PairingRejected(_) | ProtocolError::PairingTimeout(_)
        )
    }

    /// Convert an elapsed tokio timeout into a [`ProtocolError::Timeout`]
    pub(crate) fn timeout(context: impl Into<String>) -> Self {
        ProtocolError::Timeout(context.into())
    }
}
