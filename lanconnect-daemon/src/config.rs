//! Daemon Configuration
//!
//! Loaded from `$XDG_CONFIG_HOME/lanconnect/daemon.toml`, written with
//! defaults on first start. Every key is optional.

use anyhow::{Context, Result};
use lanconnect_protocol::connection::SessionTimeouts;
use lanconnect_protocol::discovery::DiscoveryConfig;
use lanconnect_protocol::pairing::PAIRING_TIMEOUT;
use lanconnect_protocol::plugins::clipboard::CommandClipboard;
use lanconnect_protocol::{DeviceInfo, DeviceType, ServerConfig, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Directory name under the XDG config and data directories
const APP_DIR: &str = "lanconnect";

/// Configuration file name
const CONFIG_FILE: &str = "daemon.toml";

/// Device id file name inside the data directory
const DEVICE_ID_FILE: &str = "id";

/// Daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub network: NetworkConfig,
    pub plugins: PluginConfig,
    pub paths: PathConfig,
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device name shown to peers
    pub name: String,

    /// desktop, laptop, phone, tablet or tv
    pub device_type: String,

    /// Fixed device id, overrides the id file
    pub device_id: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP discovery port
    pub discovery_port: u16,

    /// TCP port sessions are accepted on
    pub tcp_port: u16,

    /// Where identity broadcasts are sent
    pub broadcast_address: Ipv4Addr,

    /// Re-broadcast interval in seconds, 0 announces once
    pub broadcast_interval: u64,

    pub enable_mdns: bool,

    /// Seconds
    pub connect_timeout: u64,

    /// Seconds
    pub pairing_timeout: u64,

    /// mDNS browse window for device listings, in seconds
    pub browse_timeout: u64,
}

/// Plugin configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PluginConfig {
    pub enable_ping: bool,
    pub enable_clipboard: bool,

    /// Command receiving new clipboard content on stdin
    pub clipboard_copy_command: String,

    /// Long-running command printing clipboard content on every change
    pub clipboard_watch_command: String,
}

/// Storage paths configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathConfig {
    /// Configuration directory
    pub config_dir: PathBuf,

    /// Data directory (device id, trusted certificates)
    pub data_dir: PathBuf,

    /// Certificate directory
    pub cert_dir: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "Unknown Device".to_string()),
            device_type: detect_device_type().as_str().to_string(),
            device_id: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_PORT,
            tcp_port: DEFAULT_PORT,
            broadcast_address: Ipv4Addr::BROADCAST,
            broadcast_interval: 0,
            enable_mdns: true,
            connect_timeout: 10,
            pairing_timeout: PAIRING_TIMEOUT.as_secs(),
            browse_timeout: 3,
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enable_ping: true,
            enable_clipboard: true,
            clipboard_copy_command: "wl-copy".to_string(),
            clipboard_watch_command: "wl-paste -t text -w tee".to_string(),
        }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(APP_DIR);

        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(APP_DIR);

        let cert_dir = config_dir.join("certs");

        Self {
            config_dir,
            data_dir,
            cert_dir,
        }
    }
}

/// Laptop when a battery is present, desktop otherwise
fn detect_device_type() -> DeviceType {
    if Path::new("/sys/class/power_supply/BAT0").exists() {
        DeviceType::Laptop
    } else {
        DeviceType::Desktop
    }
}

impl Config {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        PathConfig::default().config_dir.join(CONFIG_FILE)
    }

    /// Load configuration from `path`, creating it with defaults if missing
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {:?}", path))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {:?}", path))?;
            debug!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            info!("Wrote default configuration to {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Ensure all required directories exist
    ///
    /// The data directory holds trust records and is created with mode 0700.
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir)
            .context("Failed to create config directory")?;
        fs::create_dir_all(&self.paths.data_dir).context("Failed to create data directory")?;
        fs::create_dir_all(&self.paths.cert_dir)
            .context("Failed to create certificate directory")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.paths.data_dir, fs::Permissions::from_mode(0o700))
                .context("Failed to restrict data directory")?;
        }

        Ok(())
    }

    /// Get the certificate path for this device
    pub fn certificate_path(&self) -> PathBuf {
        self.paths.cert_dir.join("device.crt")
    }

    /// Get the private key path for this device
    pub fn private_key_path(&self) -> PathBuf {
        self.paths.cert_dir.join("device.key")
    }

    pub fn device_type(&self) -> Result<DeviceType> {
        self.device
            .device_type
            .parse::<DeviceType>()
            .with_context(|| format!("Invalid device type {:?}", self.device.device_type))
    }

    /// The configured device id, else the one stored in the data directory
    ///
    /// A fresh id is generated and stored on first start.
    pub fn device_id(&self) -> Result<String> {
        if let Some(device_id) = &self.device.device_id {
            return Ok(device_id.clone());
        }

        let path = self.paths.data_dir.join(DEVICE_ID_FILE);
        if path.exists() {
            let device_id = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read device id from {:?}", path))?
                .trim()
                .to_string();
            if !device_id.is_empty() {
                return Ok(device_id);
            }
        }

        let device_id = DeviceInfo::generate_device_id();
        fs::write(&path, &device_id)
            .with_context(|| format!("Failed to write device id to {:?}", path))?;
        info!("Generated device id {}", device_id);
        Ok(device_id)
    }

    /// Server settings for `identity`
    pub fn server_config(&self, identity: DeviceInfo) -> ServerConfig {
        let network = &self.network;
        let mut config = ServerConfig::new(identity);

        config.tcp_port = network.tcp_port;
        config.discovery = DiscoveryConfig {
            listen_port: network.discovery_port,
            broadcast_target: SocketAddr::new(
                IpAddr::V4(network.broadcast_address),
                network.discovery_port,
            ),
            broadcast_interval: Duration::from_secs(network.broadcast_interval),
            enable_mdns: network.enable_mdns,
        };
        config.timeouts = SessionTimeouts {
            connect: Duration::from_secs(network.connect_timeout),
            pairing: Duration::from_secs(network.pairing_timeout),
            ..SessionTimeouts::default()
        };
        config.browse_timeout = Duration::from_secs(network.browse_timeout);
        config.enable_ping = self.plugins.enable_ping;
        if self.plugins.enable_clipboard {
            config.clipboard = Some(Arc::new(CommandClipboard::from_command_lines(
                &self.plugins.clipboard_copy_command,
                &self.plugins.clipboard_watch_command,
            )));
        }

        config
    }
}
