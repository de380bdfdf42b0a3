//! intouch - Command-line bridge for in.touch 2 spas
//!
//! Relays a spa to controller apps and mirrors its memory.

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use intouch_bridge::{BridgeConfig, Relay, SpaConnection, SpaEvent};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// intouch - in.touch 2 spa bridge
#[derive(Parser)]
#[command(name = "intouch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Spa address as host or host:port
    #[arg(long, env = "SPA_TARGET")]
    spa_target: Option<String>,

    /// Size of the spa memory image; enables the bridge session
    #[arg(long)]
    spa_memory_size: Option<u16>,

    /// Seconds without traffic before a session expires
    #[arg(long)]
    spa_udp_timeout: Option<u64>,

    /// Seconds to wait for a hello answer
    #[arg(long)]
    spa_handshake_timeout: Option<u64>,

    /// Address controller apps connect to
    #[arg(long)]
    forward_listen: Option<SocketAddr>,

    /// Log every relayed package
    #[arg(long)]
    dump_traffic: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Config file values overridden by flags
    fn bridge_config(&self) -> Result<BridgeConfig> {
        let mut config = match self.config {
            Some(ref path) => load_config(path)?,
            None => BridgeConfig::default(),
        };

        if let Some(ref target) = self.spa_target {
            config.spa_target = target.clone();
        }
        if let Some(size) = self.spa_memory_size {
            config.spa_memory_size = Some(size);
        }
        if let Some(timeout) = self.spa_udp_timeout {
            config.spa_udp_timeout = timeout;
        }
        if let Some(timeout) = self.spa_handshake_timeout {
            config.spa_handshake_timeout = timeout;
        }
        if let Some(listen) = self.forward_listen {
            config.spa_forward_listen = Some(listen);
        }
        if self.dump_traffic {
            config.dump_traffic = true;
        }

        if config.spa_target.trim().is_empty() {
            bail!("No spa target given (use --spa-target or SPA_TARGET)");
        }
        Ok(config)
    }
}

fn load_config(path: &Path) -> Result<BridgeConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Failed to parse config {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli.log_level, cli.json_logs)?;

    let config = cli.bridge_config()?;
    println!(
        "{} Connecting to spa at {}",
        "INTOUCH".cyan().bold(),
        config.spa_target_with_port()
    );

    let mut relay = Relay::bind(&config)
        .await
        .context("Failed to start relay")?;
    println!(
        "{} Found {}",
        "INTOUCH".cyan().bold(),
        String::from_utf8_lossy(&relay.spa_hello()).green()
    );

    let spa = match config.spa_memory_size {
        Some(_) => {
            let handle = SpaConnection::spawn(&config, relay.local_link())
                .context("Failed to start spa connection")?;
            tokio::spawn(log_events(handle.subscribe()));
            Some(handle)
        }
        None => {
            info!("No spa memory size configured, relaying only");
            None
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut relay_task = tokio::spawn(relay.run(shutdown_rx));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl+c")?;
            info!("Received shutdown signal");
        }
        finished = &mut relay_task => {
            finished.context("Relay task failed")?.context("Relay failed")?;
            bail!("Relay stopped unexpectedly");
        }
    }

    if let Some(spa) = spa {
        spa.shutdown().await;
    }
    let _ = shutdown_tx.send(true);
    relay_task
        .await
        .context("Relay task failed")?
        .context("Relay failed")?;

    Ok(())
}

fn setup_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to parse log level")?;

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).compact())
            .init();
    }

    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<SpaEvent>) {
    loop {
        match events.recv().await {
            Ok(SpaEvent::Changed(change)) => info!(
                address = change.address,
                width = ?change.width,
                data = ?change.data.as_ref(),
                "State changed"
            ),
            Ok(SpaEvent::Closed) => {
                info!("Spa connection closed");
                break;
            }
            Ok(event) => info!("Spa event: {:?}", event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event log fell behind, skipped {} events", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "intouch",
            "--spa-target",
            "10.0.0.5",
            "--spa-memory-size",
            "512",
            "--forward-listen",
            "0.0.0.0:10022",
            "--dump-traffic",
        ])
        .unwrap();
        let config = cli.bridge_config().unwrap();

        assert_eq!(config.spa_target_with_port(), "10.0.0.5:10022");
        assert_eq!(config.spa_memory_size, Some(512));
        assert_eq!(config.spa_forward_listen, Some("0.0.0.0:10022".parse().unwrap()));
        assert!(config.dump_traffic);
        assert_eq!(config.spa_udp_timeout, 300);
    }

    #[test]
    fn test_config_file() {
        let config: BridgeConfig = toml::from_str(
            r#"
            spa_target = "spa.local"
            spa_memory_size = 1024
            ping_interval = 0

            [commands]
            known_keys = [1, 2, 3]

            [[commands.addresses]]
            address = 0x20
            width = "u16"
            "#,
        )
        .unwrap();

        assert_eq!(config.spa_memory_size, Some(1024));
        assert_eq!(config.ping_interval(), None);
        assert_eq!(config.commands.known_keys, vec![1, 2, 3]);
        assert_eq!(config.commands.addresses.len(), 1);
    }
}
