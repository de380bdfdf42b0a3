//! Bridge configuration

use intouch_core::{CommandConfig, DEFAULT_SPA_PORT};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Values the bridge consumes; loading them is up to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Spa endpoint as `host` or `host:port`
    pub spa_target: String,
    /// Size of the spa memory image; no spa connection is run without it
    pub spa_memory_size: Option<u16>,
    /// Seconds without traffic before a session expires
    pub spa_udp_timeout: u64,
    /// Seconds to wait for a hello answer
    pub spa_handshake_timeout: u64,
    /// Where real controller apps connect when relaying
    pub spa_forward_listen: Option<SocketAddr>,
    /// Log relayed packages
    pub dump_traffic: bool,
    /// Seconds between pings on an authorized session; 0 disables pinging
    pub ping_interval: u64,
    /// Seconds between full memory downloads
    pub full_state_interval: u64,
    pub commands: CommandConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            spa_target: String::new(),
            spa_memory_size: None,
            spa_udp_timeout: 300,
            spa_handshake_timeout: 10,
            spa_forward_listen: None,
            dump_traffic: false,
            ping_interval: 3,
            full_state_interval: 1800,
            commands: CommandConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// `spa_target` with the default port added when none is given
    pub fn spa_target_with_port(&self) -> String {
        let target = self.spa_target.trim();
        if target.parse::<SocketAddr>().is_ok() {
            return target.to_string();
        }
        if let Ok(ip) = target.parse::<IpAddr>() {
            return SocketAddr::new(ip, DEFAULT_SPA_PORT).to_string();
        }
        match target.rsplit_once(':') {
            Some((_, port)) if port.parse::<u16>().is_ok() => {
                target.to_string()
            }
            _ => format!("{}:{}", target, DEFAULT_SPA_PORT),
        }
    }

    pub fn udp_timeout(&self) -> Duration {
        Duration::from_secs(self.spa_udp_timeout)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.spa_handshake_timeout)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval > 0).then(|| Duration::from_secs(self.ping_interval))
    }

    pub fn full_state_interval(&self) -> Duration {
        Duration::from_secs(self.full_state_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.udp_timeout(), Duration::from_secs(300));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.ping_interval(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_target_port() {
        let mut config = BridgeConfig {
            spa_target: "spa.local".to_string(),
            ..Default::default()
        };
        assert_eq!(config.spa_target_with_port(), "spa.local:10022");
        config.spa_target = "10.0.0.5:4000".to_string();
        assert_eq!(config.spa_target_with_port(), "10.0.0.5:4000");
        config.spa_target = "::1".to_string();
        assert_eq!(config.spa_target_with_port(), "[::1]:10022");
        config.spa_target = "[::1]:4000".to_string();
        assert_eq!(config.spa_target_with_port(), "[::1]:4000");
    }

    #[test]
    fn test_partial_json() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{"spa_target": "spa", "spa_memory_size": 512}"#).unwrap();
        assert_eq!(config.spa_memory_size, Some(512));
        assert_eq!(config.spa_udp_timeout, 300);
        assert_eq!(config.commands.pack_type, 10);
    }
}
