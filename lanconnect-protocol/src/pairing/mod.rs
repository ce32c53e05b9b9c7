//! Device Pairing
//!
//! Pairing establishes the initial trust binding between two devices.
//!
//! ## Pairing Protocol
//!
//! 1. **Connection**: A TLS session is established with an unknown device id
//! 2. **Pairing Request**: The peer sends `kdeconnect.pair` with `pair: true`
//! 3. **Approval**: The request is published to the [`PairingBroker`] and an
//!    external approver decides
//! 4. **Pairing Response**: On approval we reply `pair: true` and pin the
//!    peer's certificate in the trust store
//! 5. **Unpair**: Either side may send `pair: false` at any time, which
//!    removes the pinned certificate

pub mod broker;
pub mod events;

use crate::packet::{PacketBody, PACKET_TYPE_PAIR};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use broker::{PairingBroker, PairingDecision, PairingTicket, PendingPairing};
pub use events::PairingEvent;

/// Default time an approver has to decide on a pairing request
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of `kdeconnect.pair`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairBody {
    /// `true` requests or accepts pairing, `false` rejects or unpairs
    pub pair: bool,
}

impl PacketBody for PairBody {
    const TYPE: &'static str = PACKET_TYPE_PAIR;
}

impl PairBody {
    /// Pairing request or acceptance
    pub fn accept() -> Self {
        Self { pair: true }
    }

    /// Pairing rejection or unpair
    pub fn reject() -> Self {
        Self { pair: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Packet;

    #[test]
    fn test_pair_body_wire_format() {
        let packet = Packet::from_body(&PairBody::accept()).unwrap().with_id(1);
        assert_eq!(
            String::from_utf8(packet.to_bytes().unwrap()).unwrap(),
            "{\"id\":1,\"type\":\"kdeconnect.pair\",\"body\":{\"pair\":true}}\n"
        );
    }

    #[test]
    fn test_pair_body_parsing() {
        let packet =
            Packet::from_bytes(br#"{"id":1,"type":"kdeconnect.pair","body":{"pair":false}}"#)
                .unwrap();
        assert_eq!(packet.body_as::<PairBody>().unwrap(), PairBody::reject());

        let missing = Packet::from_bytes(br#"{"id":1,"type":"kdeconnect.pair","body":{}}"#).unwrap();
        assert!(missing.body_as::<PairBody>().is_err());
    }
}
