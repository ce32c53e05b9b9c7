//! Network Packet (Envelope)
//!
//! Packets are JSON objects terminated by a single newline:
//!
//! ```text
//! {"id":1700000000000,"type":"kdeconnect.ping","body":{"message":"hi"}}
//! ```
//!
//! - `id`: time-derived, strictly increasing within this process
//! - `type`: capability tag (`kdeconnect.<plugin>[.<action>]`)
//! - `body`: capability-specific payload
//!
//! A packet built locally always carries the tag declared by its body type
//! ([`PacketBody::TYPE`]); there is no constructor taking a free-form tag.
//! Packets read from the wire may carry any tag and are checked only when a
//! typed body is extracted with [`Packet::body_as`].

use crate::{ProtocolError, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};

/// Identity announcement (UDP discovery and plaintext handshake line)
pub const PACKET_TYPE_IDENTITY: &str = "kdeconnect.identity";
/// Pairing request / response / unpair
pub const PACKET_TYPE_PAIR: &str = "kdeconnect.pair";
/// Ping
pub const PACKET_TYPE_PING: &str = "kdeconnect.ping";
/// Clipboard content update
pub const PACKET_TYPE_CLIPBOARD: &str = "kdeconnect.clipboard";
/// Clipboard sync on connect
pub const PACKET_TYPE_CLIPBOARD_CONNECT: &str = "kdeconnect.clipboard.connect";

/// A typed packet body bound to exactly one capability tag
///
/// # Examples
///
/// ```
/// use lanconnect_protocol::packet::{Packet, PacketBody};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Battery {
///     charge: u8,
/// }
///
/// impl PacketBody for Battery {
///     const TYPE: &'static str = "kdeconnect.battery";
/// }
///
/// let packet = Packet::from_body(&Battery { charge: 42 }).unwrap();
/// assert_eq!(packet.packet_type(), "kdeconnect.battery");
/// ```
pub trait PacketBody: Serialize + DeserializeOwned {
    /// Capability tag written into the envelope's `type` field
    const TYPE: &'static str;
}

/// A protocol envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    /// Packet id (UNIX milliseconds, some clients send it as a string)
    #[serde(deserialize_with = "deserialize_id")]
    pub id: i64,

    #[serde(rename = "type")]
    packet_type: String,

    #[serde(default)]
    body: Value,
}

impl Packet {
    /// Build an envelope from a typed body
    ///
    /// The `type` field is taken from `B::TYPE`.
    pub fn from_body<B: PacketBody>(body: &B) -> Result<Self> {
        Ok(Self {
            id: next_packet_id(),
            packet_type: B::TYPE.to_string(),
            body: serde_json::to_value(body)?,
        })
    }

    /// Replace the packet id
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    /// Capability tag of this packet
    pub fn packet_type(&self) -> &str {
        &self.packet_type
    }

    /// Raw JSON body
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Check if packet is of a specific type
    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Decode the body as `B`
    ///
    /// Fails with [`ProtocolError::PacketTypeMismatch`] when the envelope's tag
    /// is not `B::TYPE`, and with [`ProtocolError::InvalidPacket`] when the
    /// body does not have the expected shape.
    pub fn body_as<B: PacketBody>(&self) -> Result<B> {
        if self.packet_type != B::TYPE {
            return Err(ProtocolError::PacketTypeMismatch {
                expected: B::TYPE,
                actual: self.packet_type.clone(),
            });
        }

        B::deserialize(&self.body).map_err(|e| {
            ProtocolError::InvalidPacket(format!("Malformed {} body: {}", B::TYPE, e))
        })
    }

    /// Serialize packet to bytes with newline terminator
    ///
    /// ```
    /// use lanconnect_protocol::packet::Packet;
    /// use lanconnect_protocol::plugins::ping::PingBody;
    ///
    /// let packet = Packet::from_body(&PingBody::default()).unwrap();
    /// let bytes = packet.to_bytes().unwrap();
    /// assert_eq!(bytes.last(), Some(&b'\n'));
    /// ```
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Deserialize a packet from bytes
    ///
    /// Accepts `\n`, `\r\n` or no terminator.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let trimmed = data
            .strip_suffix(b"\r\n")
            .or_else(|| data.strip_suffix(b"\n"))
            .unwrap_or(data);

        serde_json::from_slice(trimmed).map_err(|e| {
            ProtocolError::InvalidPacket(format!("Failed to deserialize packet: {}", e))
        })
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::custom("Invalid number for id")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| Error::custom("Invalid string for id")),
        _ => Err(Error::custom("id must be a number or string")),
    }
}

/// Current UNIX timestamp in milliseconds
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

static LAST_PACKET_ID: AtomicI64 = AtomicI64::new(0);

/// Next packet id: the current timestamp, bumped past the previous id if the
/// clock has not advanced
fn next_packet_id() -> i64 {
    let now = current_timestamp();
    let previous = LAST_PACKET_ID
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now);
    now.max(previous + 1)
}
