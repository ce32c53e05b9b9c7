//! DBus Control Surface
//!
//! Exposes the local operator commands (pair, deny, unpair, list, ping) on
//! the session bus and forwards pairing requests and session state changes
//! as signals.

use anyhow::{Context, Result};
use lanconnect_protocol::connection::SessionEvent;
use lanconnect_protocol::pairing::PairingEvent;
use lanconnect_protocol::{DeviceDescriptor, PairOutcome, Server};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use zbus::object_server::SignalEmitter;
use zbus::{connection, interface, Connection};

/// DBus service name
pub const SERVICE_NAME: &str = "org.lanconnect.Daemon";

/// DBus object path
pub const OBJECT_PATH: &str = "/org/lanconnect/Daemon";

/// Device entry returned by `ListDevices`
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, zbus::zvariant::Type)]
pub struct DeviceEntry {
    pub id: String,
    /// Empty when the name is unknown
    pub name: String,
    pub device_type: String,
    /// `ip:port`, empty when never discovered
    pub address: String,
    /// discovered, trusted, awaiting-pairing or connected
    pub status: String,
}

impl From<DeviceDescriptor> for DeviceEntry {
    fn from(device: DeviceDescriptor) -> Self {
        Self {
            id: device.device_id,
            name: device.device_name.unwrap_or_default(),
            device_type: device
                .device_type
                .map(|t| t.as_str().to_string())
                .unwrap_or_default(),
            address: device.address.map(|a| a.to_string()).unwrap_or_default(),
            status: device.status.as_str().to_string(),
        }
    }
}

fn failed(error: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(error.to_string())
}

/// DBus interface backed by the [`Server`]
pub struct ControlInterface {
    server: Arc<Server>,
}

impl ControlInterface {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }
}

#[interface(name = "org.lanconnect.Daemon")]
impl ControlInterface {
    /// Approve pairing with a device
    ///
    /// Waits for the device to ask if it has not yet.
    async fn pair(&self, device_id: String) -> zbus::fdo::Result<String> {
        info!("DBus: Pair called for {}", device_id);

        let message = match self.server.pair(&device_id).await.map_err(failed)? {
            PairOutcome::AlreadyPaired => format!("{} is already paired", device_id),
            PairOutcome::Approved => format!("Paired with {}", device_id),
            PairOutcome::NoRequest => {
                return Err(failed(format!(
                    "{} did not request pairing in time",
                    device_id
                )))
            }
        };
        Ok(message)
    }

    /// Reject an outstanding pairing request
    async fn deny(&self, device_id: String) -> zbus::fdo::Result<String> {
        info!("DBus: Deny called for {}", device_id);

        if self.server.deny(&device_id) {
            Ok(format!("Denied pairing with {}", device_id))
        } else {
            Err(failed(format!("No pairing request from {}", device_id)))
        }
    }

    /// Forget a device and close its session
    async fn unpair(&self, device_id: String) -> zbus::fdo::Result<String> {
        info!("DBus: Unpair called for {}", device_id);

        if self.server.unpair(&device_id).await.map_err(failed)? {
            Ok(format!("Unpaired {}", device_id))
        } else {
            Ok(format!("{} was not paired", device_id))
        }
    }

    /// Discovered, trusted, pending and connected devices
    async fn list_devices(&self) -> zbus::fdo::Result<Vec<DeviceEntry>> {
        debug!("DBus: ListDevices called");

        let devices: Vec<DeviceEntry> = self
            .server
            .devices()
            .await
            .map_err(failed)?
            .into_iter()
            .map(DeviceEntry::from)
            .collect();

        debug!("DBus: Returning {} devices", devices.len());
        Ok(devices)
    }

    /// Ping a connected device, an empty message sends a bare ping
    async fn ping(&self, device_id: String, message: String) -> zbus::fdo::Result<String> {
        debug!("DBus: Ping called for {}", device_id);

        let message = (!message.is_empty()).then_some(message);
        self.server
            .ping(&device_id, message)
            .await
            .map_err(failed)?;
        Ok(format!("Pinged {}", device_id))
    }

    /// Signal: a device asks to pair
    #[zbus(signal)]
    async fn pairing_requested(
        emitter: &SignalEmitter<'_>,
        device_id: &str,
        device_name: &str,
        fingerprint: &str,
    ) -> zbus::Result<()>;

    /// Signal: a session moved to a new state
    #[zbus(signal)]
    async fn session_state_changed(
        emitter: &SignalEmitter<'_>,
        device_id: &str,
        state: &str,
    ) -> zbus::Result<()>;
}

/// DBus server for the daemon
pub struct DbusServer {
    connection: Connection,
}

impl DbusServer {
    /// Claim the service name and serve the control interface
    pub async fn start(server: Arc<Server>) -> Result<Self> {
        info!("Starting DBus server on {}", SERVICE_NAME);

        let connection = connection::Builder::session()?
            .name(SERVICE_NAME)?
            .serve_at(OBJECT_PATH, ControlInterface::new(server))?
            .build()
            .await
            .context("Failed to build DBus connection")?;

        info!("DBus server started");
        Ok(Self { connection })
    }

    /// Forward pairing and session events as signals until `cancel` fires
    pub fn spawn_signal_bridge(
        &self,
        server: &Server,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) {
        let connection = self.connection.clone();
        let mut pairing = server.broker().subscribe();
        let mut sessions = server.subscribe();

        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = pairing.recv() => match event {
                        Ok(event) => emit_pairing(&connection, event).await,
                        Err(RecvError::Lagged(skipped)) => warn!("Dropped {} pairing events", skipped),
                        Err(RecvError::Closed) => break,
                    },
                    event = sessions.recv() => match event {
                        Ok(event) => emit_session(&connection, event).await,
                        Err(RecvError::Lagged(skipped)) => warn!("Dropped {} session events", skipped),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("DBus signal bridge stopped");
        });
    }
}

async fn emit_pairing(connection: &Connection, event: PairingEvent) {
    let PairingEvent::RequestReceived {
        device_id,
        device_name,
        fingerprint,
    } = event
    else {
        return;
    };

    let result = async {
        let iface = connection
            .object_server()
            .interface::<_, ControlInterface>(OBJECT_PATH)
            .await?;
        ControlInterface::pairing_requested(
            iface.signal_emitter(),
            &device_id,
            &device_name,
            &fingerprint,
        )
        .await
    }
    .await;

    match result {
        Ok(()) => debug!("Emitted PairingRequested for {}", device_id),
        Err(e) => warn!("Failed to emit PairingRequested for {}: {}", device_id, e),
    }
}

async fn emit_session(connection: &Connection, event: SessionEvent) {
    let (device_id, state) = match event {
        SessionEvent::StateChanged { device_id, state } => (device_id, state.to_string()),
        SessionEvent::Closed { device_id, reason } => (device_id, format!("closed: {}", reason)),
    };

    let result = async {
        let iface = connection
            .object_server()
            .interface::<_, ControlInterface>(OBJECT_PATH)
            .await?;
        ControlInterface::session_state_changed(iface.signal_emitter(), &device_id, &state).await
    }
    .await;

    if let Err(e) = result {
        warn!("Failed to emit SessionStateChanged for {}: {}", device_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanconnect_protocol::{DeviceStatus, DeviceType};

    #[test]
    fn test_device_entry_from_descriptor() {
        let entry = DeviceEntry::from(DeviceDescriptor {
            device_id: "phone_1".to_string(),
            device_name: Some("Phone".to_string()),
            device_type: Some(DeviceType::Phone),
            address: Some("192.168.1.20:1716".parse().unwrap()),
            status: DeviceStatus::AwaitingPairing,
        });

        assert_eq!(entry.id, "phone_1");
        assert_eq!(entry.name, "Phone");
        assert_eq!(entry.device_type, "phone");
        assert_eq!(entry.address, "192.168.1.20:1716");
        assert_eq!(entry.status, "awaiting-pairing");
    }

    #[test]
    fn test_device_entry_unknown_fields_are_empty() {
        let entry = DeviceEntry::from(DeviceDescriptor {
            device_id: "trusted_only".to_string(),
            device_name: None,
            device_type: None,
            address: None,
            status: DeviceStatus::Trusted,
        });

        assert!(entry.name.is_empty());
        assert!(entry.address.is_empty());
        assert_eq!(entry.status, "trusted");
    }
}
