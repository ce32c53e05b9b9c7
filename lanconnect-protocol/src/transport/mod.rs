//! Network Transport
//!
//! - [`tcp`]: plaintext dial/accept and the identity line
//! - [`tls`]: TLS upgrade in either role and peer certificate extraction
//! - [`framing`]: newline-delimited packet reading and writing

pub mod framing;
pub mod tcp;
pub mod tls;

pub use framing::{write_packet, PacketReader, MAX_PACKET_SIZE};
pub use tcp::TcpConnection;
pub use tls::{peer_certificate, TlsConfig};
