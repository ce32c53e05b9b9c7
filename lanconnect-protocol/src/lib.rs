//! LAN Connect Protocol
//!
//! A KDE Connect compatible implementation of discovery, secure session
//! establishment, trust-on-first-use pairing and packet routing.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                    Server                     │
//! │   (listener, discovery, control operations)   │
//! └───────┬───────────────────┬───────────────────┘
//!         │                   │
//!  ┌──────▼──────┐     ┌──────▼──────┐     ┌──────────────┐
//!  │  Discovery  │────▶│  Handshake  │────▶│ Session loop │
//!  │ (UDP, mDNS) │     │ (TLS, trust)│     │  (plugins)   │
//!  └─────────────┘     └──────┬──────┘     └──────────────┘
//!                             │
//!                ┌────────────┴────────────┐
//!         ┌──────▼──────┐          ┌───────▼──────┐
//!         │ Trust store │          │Pairing broker│
//!         └─────────────┘          └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use lanconnect_protocol::trust::MemoryTrustStore;
//! use lanconnect_protocol::pairing::PairingBroker;
//! use lanconnect_protocol::{CertificateInfo, DeviceInfo, DeviceType, Server, ServerConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> lanconnect_protocol::Result<()> {
//! let identity = DeviceInfo::new(
//!     DeviceInfo::generate_device_id(),
//!     "My Computer",
//!     DeviceType::Desktop,
//!     1716,
//! );
//! let certificate = CertificateInfo::generate(identity.device_id.clone())?;
//!
//! let server = Server::bind(
//!     ServerConfig::new(identity),
//!     &certificate,
//!     Arc::new(MemoryTrustStore::new()),
//!     PairingBroker::new(),
//! )
//! .await?;
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod certificate;
pub mod connection;
pub mod discovery;
pub mod identity;
pub mod packet;
pub mod pairing;
pub mod plugins;
pub mod server;
pub mod transport;
pub mod trust;

mod error;

pub use certificate::CertificateInfo;
pub use error::{ProtocolError, Result};
pub use identity::{DeviceInfo, DeviceType};
pub use packet::{current_timestamp, Packet};
pub use server::{DeviceDescriptor, DeviceStatus, PairOutcome, Server, ServerConfig};

/// Protocol version we implement
pub const PROTOCOL_VERSION: u32 = 7;

/// Default port for UDP discovery and TCP sessions
pub const DEFAULT_PORT: u16 = 1716;
