//! mDNS/DNS-SD advertisement
//!
//! KDE Connect peers register `_kdeconnect._udp.local.` with the device id
//! as instance name and these TXT properties:
//!
//! | key        | value                     |
//! |------------|---------------------------|
//! | `id`       | device id                 |
//! | `name`     | device name               |
//! | `type`     | device type               |
//! | `protocol` | protocol version          |

use crate::{DeviceInfo, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// mDNS service type
pub const SERVICE_TYPE: &str = "_kdeconnect._udp.local.";

/// How long to wait for the daemon to confirm unregistration
const UNREGISTER_TIMEOUT: Duration = Duration::from_millis(500);

/// TXT record keys
pub mod txt_keys {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const TYPE: &str = "type";
    pub const PROTOCOL: &str = "protocol";
}

/// TXT properties advertised for `identity`
pub fn txt_properties(identity: &DeviceInfo) -> Vec<(&'static str, String)> {
    vec![
        (txt_keys::ID, identity.device_id.clone()),
        (txt_keys::NAME, identity.device_name.clone()),
        (txt_keys::TYPE, identity.device_type.as_str().to_string()),
        (txt_keys::PROTOCOL, identity.protocol_version.to_string()),
    ]
}

/// mDNS host name for this machine (`<hostname>.local.`)
fn local_hostname() -> String {
    let raw = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string());

    if raw.ends_with(".local.") {
        raw
    } else if raw.to_lowercase().ends_with(".local") {
        format!("{}.", raw)
    } else {
        format!("{}.local.", raw)
    }
}

/// Registered advertisement, removed by [`MdnsAdvertiser::stop`]
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    fullname: String,
}

impl MdnsAdvertiser {
    /// Register our service on `port`
    pub fn start(identity: &DeviceInfo, port: u16) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;
        let properties = txt_properties(identity);

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &identity.device_id,
            &local_hostname(),
            (),
            port,
            properties.as_slice(),
        )?
        .enable_addr_auto();

        let fullname = service.get_fullname().to_string();
        daemon.register(service)?;
        info!("Advertising {} over mDNS", fullname);

        Ok(Self { daemon, fullname })
    }

    /// Unregister and shut the daemon down
    pub async fn stop(self) {
        match self.daemon.unregister(&self.fullname) {
            Ok(receiver) => {
                match tokio::time::timeout(UNREGISTER_TIMEOUT, receiver.recv_async()).await {
                    Ok(Ok(status)) => debug!("mDNS unregister: {:?}", status),
                    Ok(Err(_)) | Err(_) => debug!("mDNS unregister not confirmed"),
                }
            }
            Err(e) => debug!("Failed to unregister {}: {}", self.fullname, e),
        }

        if let Err(e) = self.daemon.shutdown() {
            debug!("mDNS daemon shutdown failed: {}", e);
        }
        info!("Stopped mDNS advertisement {}", self.fullname);
    }
}

/// A peer found by browsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdnsPeer {
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
    pub protocol_version: Option<u32>,
    pub port: u16,
}

/// Browse for advertised peers for `timeout`
///
/// Peers without an `id` property are skipped.
pub async fn browse(timeout: Duration) -> Result<Vec<MdnsPeer>> {
    let daemon = ServiceDaemon::new()?;
    let receiver = daemon.browse(SERVICE_TYPE)?;
    let deadline = tokio::time::Instant::now() + timeout;
    let mut found = HashMap::new();

    loop {
        let event = match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
            Ok(Ok(event)) => event,
            Ok(Err(_)) | Err(_) => break,
        };

        if let ServiceEvent::ServiceResolved(service) = event {
            let property = |key: &str| service.get_property_val_str(key).map(str::to_string);

            let Some(device_id) = property(txt_keys::ID) else {
                continue;
            };
            debug!("mDNS resolved {}", device_id);

            found.insert(
                device_id.clone(),
                MdnsPeer {
                    device_name: property(txt_keys::NAME).unwrap_or_else(|| device_id.clone()),
                    device_type: property(txt_keys::TYPE).unwrap_or_default(),
                    protocol_version: property(txt_keys::PROTOCOL).and_then(|v| v.parse().ok()),
                    port: service.get_port(),
                    device_id,
                },
            );
        }
    }

    if let Err(e) = daemon.stop_browse(SERVICE_TYPE) {
        debug!("Failed to stop mDNS browse: {}", e);
    }
    if let Err(e) = daemon.shutdown() {
        debug!("mDNS daemon shutdown failed: {}", e);
    }

    let mut peers: Vec<_> = found.into_values().collect();
    peers.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    Ok(peers)
}
