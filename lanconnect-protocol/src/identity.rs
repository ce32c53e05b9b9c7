//! Device Identity
//!
//! The identity body (`kdeconnect.identity`) describes a device. It is sent
//! in UDP discovery datagrams and as the plaintext first line of every TCP
//! connection, before the TLS upgrade.
//!
//! - `deviceId`: stable identifier (UUIDv4 with underscores)
//! - `deviceName`: human readable name
//! - `deviceType`: desktop, laptop, phone, tablet or tv
//! - `protocolVersion`: protocol version (7)
//! - `incomingCapabilities` / `outgoingCapabilities`: capability tags
//! - `tcpPort`: port the device accepts connections on

use crate::packet::{PacketBody, PACKET_TYPE_IDENTITY};
use crate::{ProtocolError, Result, DEFAULT_PORT, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Maximum accepted device id length
const MAX_DEVICE_ID_LEN: usize = 128;

/// Device class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    #[serde(alias = "smartphone")]
    Phone,
    Tablet,
    Tv,
    /// Anything newer clients advertise that we have no name for
    #[serde(other)]
    Unknown,
}

impl DeviceType {
    /// Convert device type to string
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
            DeviceType::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "desktop" => Ok(DeviceType::Desktop),
            "laptop" => Ok(DeviceType::Laptop),
            "phone" | "smartphone" => Ok(DeviceType::Phone),
            "tablet" => Ok(DeviceType::Tablet),
            "tv" => Ok(DeviceType::Tv),
            other => Err(ProtocolError::InvalidPacket(format!(
                "Unknown device type: {}",
                other
            ))),
        }
    }
}

/// Device identity
///
/// Immutable once received from a peer or generated for this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Unique device identifier
    pub device_id: String,

    /// Human-readable device name
    pub device_name: String,

    /// Type of device
    pub device_type: DeviceType,

    /// Protocol version
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,

    /// Packet types this device can receive
    #[serde(default)]
    pub incoming_capabilities: Vec<String>,

    /// Packet types this device can send
    #[serde(default)]
    pub outgoing_capabilities: Vec<String>,

    /// TCP port for connections (0 when not advertised)
    #[serde(default)]
    pub tcp_port: u16,
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

impl PacketBody for DeviceInfo {
    const TYPE: &'static str = PACKET_TYPE_IDENTITY;
}

impl DeviceInfo {
    /// Create a DeviceInfo with an explicit device id
    ///
    /// # Examples
    ///
    /// ```
    /// use lanconnect_protocol::{DeviceInfo, DeviceType};
    ///
    /// let info = DeviceInfo::new("abc_123", "My Computer", DeviceType::Desktop, 1716)
    ///     .with_incoming_capability("kdeconnect.ping");
    /// assert_eq!(info.incoming_capabilities, vec!["kdeconnect.ping"]);
    /// ```
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
        tcp_port: u16,
    ) -> Self {
        let device_name = device_name.into();
        if device_name.is_empty() || device_name.chars().count() > 32 {
            warn!(
                "Device name should be 1-32 characters, got: {}",
                device_name
            );
        }

        Self {
            device_id: device_id.into(),
            device_name,
            device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
            tcp_port,
        }
    }

    /// Generate a fresh UUIDv4 device id with underscores
    pub fn generate_device_id() -> String {
        Uuid::new_v4().to_string().replace('-', "_")
    }

    /// Add an incoming capability
    pub fn with_incoming_capability(mut self, capability: impl Into<String>) -> Self {
        self.incoming_capabilities.push(capability.into());
        self
    }

    /// Add an outgoing capability
    pub fn with_outgoing_capability(mut self, capability: impl Into<String>) -> Self {
        self.outgoing_capabilities.push(capability.into());
        self
    }

    /// Set all incoming capabilities at once
    pub fn with_incoming_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.incoming_capabilities = capabilities;
        self
    }

    /// Set all outgoing capabilities at once
    pub fn with_outgoing_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.outgoing_capabilities = capabilities;
        self
    }

    /// Replace the advertised TCP port
    pub fn with_tcp_port(mut self, tcp_port: u16) -> Self {
        self.tcp_port = tcp_port;
        self
    }

    /// Port to dial for this device: the advertised one, or the default
    /// port when the peer did not advertise any
    pub fn connect_port(&self) -> u16 {
        if self.tcp_port == 0 {
            DEFAULT_PORT
        } else {
            self.tcp_port
        }
    }

    /// Check that the identity is usable for a session
    pub fn validate(&self) -> Result<()> {
        validate_device_id(&self.device_id)
    }
}

/// Reject device ids that are empty, oversized or unsafe as file names
pub fn validate_device_id(device_id: &str) -> Result<()> {
    let valid = !device_id.is_empty()
        && device_id.len() <= MAX_DEVICE_ID_LEN
        && device_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidDeviceId(device_id.to_string()))
    }
}
