mod config;
mod dbus;

use anyhow::{Context, Result};
use clap::Parser;
use lanconnect_protocol::pairing::PairingBroker;
use lanconnect_protocol::trust::FileTrustStore;
use lanconnect_protocol::{CertificateInfo, DeviceInfo, Server};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use dbus::DbusServer;

/// KDE Connect compatible pairing and messaging daemon
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file (default: $XDG_CONFIG_HOME/lanconnect/daemon.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise (also DEBUG=1)
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

fn init_logging(cli: &Cli) {
    let debug = cli.debug || std::env::var("DEBUG").is_ok_and(|value| value == "1");
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Load the device certificate, generating it when missing or issued for
/// another device id
fn load_or_generate_certificate(config: &Config, device_id: &str) -> Result<CertificateInfo> {
    let cert_path = config.certificate_path();
    let key_path = config.private_key_path();

    if cert_path.exists() && key_path.exists() {
        info!("Loading existing certificate from {:?}", cert_path);
        let certificate = CertificateInfo::load_from_files(&cert_path, &key_path)
            .context("Failed to load certificate")?;

        if certificate.device_id == device_id {
            return Ok(certificate);
        }
        warn!(
            "Certificate was issued for {}, regenerating for {}",
            certificate.device_id, device_id
        );
    }

    info!("Generating new device certificate");
    let certificate =
        CertificateInfo::generate(device_id).context("Failed to generate certificate")?;
    certificate
        .save_to_files(&cert_path, &key_path)
        .context("Failed to save certificate")?;

    Ok(certificate)
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    info!("Starting LAN Connect daemon...");

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path).context("Failed to load configuration")?;
    config
        .ensure_directories()
        .context("Failed to create directories")?;

    let device_id = config.device_id()?;
    let device_type = config.device_type()?;
    let certificate = load_or_generate_certificate(&config, &device_id)?;
    info!("Certificate fingerprint: {}", certificate.fingerprint);

    let identity = DeviceInfo::new(
        device_id,
        config.device.name.clone(),
        device_type,
        config.network.tcp_port,
    );
    identity.validate().context("Invalid device identity")?;

    let trust = FileTrustStore::open(&config.paths.data_dir)
        .await
        .context("Failed to open trust store")?;

    let server = Server::bind(
        config.server_config(identity),
        &certificate,
        Arc::new(trust),
        PairingBroker::new(),
    )
    .await
    .context("Failed to bind TCP listener")?;
    let server = Arc::new(server);

    server.start().await.context("Failed to start server")?;

    let identity = server.identity();
    info!(
        "Device: {} ({}, {})",
        identity.device_name,
        identity.device_id,
        identity.device_type.as_str()
    );
    info!("Protocol version: {}", identity.protocol_version);
    info!("Listening on TCP {}", server.local_addr());

    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();

    // Keep the connection alive for the lifetime of the daemon
    let _dbus = match DbusServer::start(server.clone()).await {
        Ok(dbus) => {
            dbus.spawn_signal_bridge(&server, &tracker, cancel.clone());
            Some(dbus)
        }
        Err(e) => {
            warn!("DBus control surface unavailable: {:#}", e);
            None
        }
    };

    info!("Daemon running, press Ctrl+C to stop");
    shutdown_signal().await?;
    info!("Received shutdown signal");

    cancel.cancel();
    tracker.close();
    server.shutdown().await;
    tracker.wait().await;

    info!("Daemon shutdown complete");
    Ok(())
}
