// ============================================
// File: crates/warren-server/src/config.rs
// ============================================
//! # Server Configuration
//!
//! ## Creation Reason
//! Provides configuration management for the Warren server,
//! supporting TOML files with validated, defaulted sections.
//!
//! ## Main Functionality
//! - `ServerConfig`: Main configuration structure
//! - TOML file loading and parsing
//! - Configuration validation
//! - Sensible defaults for every section
//!
//! ## Configuration Sections
//! - `network`: listen address and wire protocol (udp/tcp)
//! - `tunnel`: device name, tun/tap mode, address range, MTU
//! - `limits`: client cap, stream queue limit, idle timeout
//! - `routing`: client-to-client switch, route aging, reaper tuning
//! - `status`: periodic status file
//! - `pool`: virtual-address persistence
//! - `logging`: log level
//!
//! ## Example Configuration
//! ```toml
//! [network]
//! listen_addr = "0.0.0.0:1194"
//! proto = "udp"
//!
//! [tunnel]
//! device_name = "warren0"
//! mode = "tun"
//! address_range = "10.8.0.0/24"
//! gateway_ip = "10.8.0.1"
//! mtu = 1500
//!
//! [limits]
//! max_clients = 1024
//! tcp_queue_limit = 64
//! session_timeout_secs = 120
//!
//! [routing]
//! enable_c2c = true
//! mroute_ageable_ttl_secs = 60
//!
//! [status]
//! file = "/run/warren/status.log"
//! version = 2
//! interval_secs = 60
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - All config changes require server restart
//! - Validate config before server startup
//! - The gateway address doubles as the server's own inner address and
//!   is excluded from learning

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use warren_core::frame::TunnelKind;

use crate::engine::reaper::ReapParams;
use crate::error::{Result, ServerError};

// ============================================
// WireProto
// ============================================

/// Wire transport the server listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProto {
    /// Datagram mode; one socket multiplexes all peers.
    Udp,
    /// Stream mode; one framed connection per peer.
    Tcp,
}

impl std::fmt::Display for WireProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

// ============================================
// ServerConfig
// ============================================

/// Main server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    /// Network configuration.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Tunnel (virtual interface + address range) configuration.
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Routing behavior.
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Status output.
    #[serde(default)]
    pub status: StatusConfig,

    /// Virtual-address pool persistence.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ServerConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.display().to_string();

        info!("Loading configuration from: {}", path_str);

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ServerError::config_load(&path_str, e.to_string()))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| ServerError::config_load(&path_str, e.to_string()))?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Loads configuration from a string (useful for testing).
    ///
    /// # Errors
    /// Returns error if parsing or validation fails.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ServerError::config_load("<string>", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns the first invalid field found.
    pub fn validate(&self) -> Result<()> {
        self.network.validate()?;
        self.tunnel.validate()?;
        self.limits.validate()?;
        self.routing.validate()?;
        self.status.validate()?;
        Ok(())
    }
}

// ============================================
// NetworkConfig
// ============================================

/// Network configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Listen address for the wire socket.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Wire protocol.
    #[serde(default = "default_proto")]
    pub proto: WireProto,
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:1194".parse().unwrap()
}

const fn default_proto() -> WireProto {
    WireProto::Udp
}

impl NetworkConfig {
    fn validate(&self) -> Result<()> {
        if self.listen_addr.port() == 0 {
            return Err(ServerError::config_invalid(
                "network.listen_addr",
                "port cannot be 0",
            ));
        }
        Ok(())
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            proto: default_proto(),
        }
    }
}

// ============================================
// TunnelConfig
// ============================================

/// Tunnel configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Virtual-interface device name.
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Whether the interface carries L3 packets (tun) or L2 frames (tap).
    #[serde(default = "default_mode")]
    pub mode: TunnelKind,

    /// Virtual address range (CIDR notation) the pool hands out.
    #[serde(default = "default_address_range")]
    pub address_range: String,

    /// Gateway address: the server's own inner address, excluded from
    /// learning and reserved in the pool.
    #[serde(default = "default_gateway_ip")]
    pub gateway_ip: Ipv4Addr,

    /// MTU size.
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

fn default_device_name() -> String {
    "warren0".to_string()
}

const fn default_mode() -> TunnelKind {
    TunnelKind::Tun
}

fn default_address_range() -> String {
    "10.8.0.0/24".to_string()
}

fn default_gateway_ip() -> Ipv4Addr {
    Ipv4Addr::new(10, 8, 0, 1)
}

const fn default_mtu() -> u16 {
    1500
}

impl TunnelConfig {
    fn validate(&self) -> Result<()> {
        if self.device_name.is_empty() {
            return Err(ServerError::config_invalid(
                "tunnel.device_name",
                "cannot be empty",
            ));
        }

        if self.device_name.len() > 15 {
            return Err(ServerError::config_invalid(
                "tunnel.device_name",
                "cannot exceed 15 characters",
            ));
        }

        if self.mtu < 576 {
            return Err(ServerError::config_invalid("tunnel.mtu", "must be at least 576"));
        }

        if self.mtu > 9000 {
            return Err(ServerError::config_invalid("tunnel.mtu", "cannot exceed 9000"));
        }

        self.parse_address_range().map(|_| ())
    }

    /// Parses the address range and returns (network, prefix_len).
    ///
    /// # Errors
    /// Returns error for malformed CIDR notation.
    pub fn parse_address_range(&self) -> Result<(Ipv4Addr, u8)> {
        let parts: Vec<&str> = self.address_range.split('/').collect();
        if parts.len() != 2 {
            return Err(ServerError::config_invalid(
                "tunnel.address_range",
                "must be in CIDR notation (e.g., 10.8.0.0/24)",
            ));
        }

        let network: Ipv4Addr = parts[0].parse().map_err(|_| {
            ServerError::config_invalid("tunnel.address_range", "invalid network address")
        })?;

        let prefix: u8 = parts[1].parse().map_err(|_| {
            ServerError::config_invalid("tunnel.address_range", "invalid prefix length")
        })?;

        if prefix > 30 {
            return Err(ServerError::config_invalid(
                "tunnel.address_range",
                "prefix length must be <= 30 for usable addresses",
            ));
        }

        Ok((network, prefix))
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            mode: default_mode(),
            address_range: default_address_range(),
            gateway_ip: default_gateway_ip(),
            mtu: default_mtu(),
        }
    }
}

// ============================================
// LimitsConfig
// ============================================

/// Resource limits configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Hard cap on concurrent client instances.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Per-instance deferred-buffer cap for stream transports.
    #[serde(default = "default_tcp_queue_limit")]
    pub tcp_queue_limit: usize,

    /// Idle window after which an instance is halted.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
}

const fn default_max_clients() -> usize {
    1024
}

const fn default_tcp_queue_limit() -> usize {
    64
}

const fn default_session_timeout() -> u64 {
    120
}

impl LimitsConfig {
    fn validate(&self) -> Result<()> {
        if self.max_clients == 0 {
            return Err(ServerError::config_invalid(
                "limits.max_clients",
                "must be greater than 0",
            ));
        }

        if self.tcp_queue_limit == 0 {
            return Err(ServerError::config_invalid(
                "limits.tcp_queue_limit",
                "must be greater than 0",
            ));
        }

        if self.session_timeout_secs == 0 {
            return Err(ServerError::config_invalid(
                "limits.session_timeout_secs",
                "must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Session timeout as a `Duration`.
    #[must_use]
    pub const fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_clients: default_max_clients(),
            tcp_queue_limit: default_tcp_queue_limit(),
            session_timeout_secs: default_session_timeout(),
        }
    }
}

// ============================================
// RoutingConfig
// ============================================

/// Routing behavior configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Forward inner frames between peers inside the server.
    #[serde(default = "default_enable_c2c")]
    pub enable_c2c: bool,

    /// Time-to-live of ageable (learned) host routes.
    #[serde(default = "default_ageable_ttl")]
    pub mroute_ageable_ttl_secs: u64,

    /// Reaper runs at least once per this many seconds; also caps the
    /// event-loop timeout.
    #[serde(default = "default_reap_max_wakeup")]
    pub reap_max_wakeup_secs: u64,

    /// How many reaper passes cover the whole route table.
    #[serde(default = "default_reap_divisor")]
    pub reap_divisor: usize,

    /// Minimum buckets scanned per reaper pass.
    #[serde(default = "default_reap_min")]
    pub reap_min: usize,

    /// Maximum buckets scanned per reaper pass.
    #[serde(default = "default_reap_max")]
    pub reap_max: usize,

    /// CIDR routes for networks behind specific peers, installed when
    /// the named peer establishes.
    #[serde(default)]
    pub iroutes: Vec<IrouteEntry>,
}

/// One internal route: a network served by a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrouteEntry {
    /// Network in CIDR notation (e.g., "10.9.0.0/16").
    pub network: String,
    /// Identity of the peer serving the network.
    pub common_name: String,
}

impl IrouteEntry {
    /// Parses the network field.
    ///
    /// # Errors
    /// Returns error for malformed CIDR notation.
    pub fn parse_network(&self) -> Result<(Ipv4Addr, u8)> {
        let parts: Vec<&str> = self.network.split('/').collect();
        if parts.len() != 2 {
            return Err(ServerError::config_invalid(
                "routing.iroutes.network",
                "must be in CIDR notation",
            ));
        }
        let network: Ipv4Addr = parts[0].parse().map_err(|_| {
            ServerError::config_invalid("routing.iroutes.network", "invalid network address")
        })?;
        let prefix: u8 = parts[1].parse().map_err(|_| {
            ServerError::config_invalid("routing.iroutes.network", "invalid prefix length")
        })?;
        if prefix > 32 {
            return Err(ServerError::config_invalid(
                "routing.iroutes.network",
                "prefix length cannot exceed 32",
            ));
        }
        Ok((network, prefix))
    }
}

const fn default_enable_c2c() -> bool {
    false
}

const fn default_ageable_ttl() -> u64 {
    60
}

const fn default_reap_max_wakeup() -> u64 {
    10
}

const fn default_reap_divisor() -> usize {
    256
}

const fn default_reap_min() -> usize {
    16
}

const fn default_reap_max() -> usize {
    1024
}

impl RoutingConfig {
    fn validate(&self) -> Result<()> {
        if self.mroute_ageable_ttl_secs == 0 {
            return Err(ServerError::config_invalid(
                "routing.mroute_ageable_ttl_secs",
                "must be greater than 0",
            ));
        }
        if self.reap_max_wakeup_secs == 0 {
            return Err(ServerError::config_invalid(
                "routing.reap_max_wakeup_secs",
                "must be greater than 0",
            ));
        }
        if self.reap_min == 0 || self.reap_max < self.reap_min {
            return Err(ServerError::config_invalid(
                "routing.reap_min/reap_max",
                "need 0 < reap_min <= reap_max",
            ));
        }
        if self.reap_divisor == 0 {
            return Err(ServerError::config_invalid(
                "routing.reap_divisor",
                "must be greater than 0",
            ));
        }
        for entry in &self.iroutes {
            entry.parse_network()?;
        }
        Ok(())
    }

    /// Reaper tuning parameters.
    #[must_use]
    pub const fn reap_params(&self) -> ReapParams {
        ReapParams {
            max_wakeup_secs: self.reap_max_wakeup_secs,
            divisor: self.reap_divisor,
            min: self.reap_min,
            max: self.reap_max,
        }
    }

    /// Ageable-route TTL as a `Duration`.
    #[must_use]
    pub const fn ageable_ttl(&self) -> Duration {
        Duration::from_secs(self.mroute_ageable_ttl_secs)
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enable_c2c: default_enable_c2c(),
            mroute_ageable_ttl_secs: default_ageable_ttl(),
            reap_max_wakeup_secs: default_reap_max_wakeup(),
            reap_divisor: default_reap_divisor(),
            reap_min: default_reap_min(),
            reap_max: default_reap_max(),
            iroutes: Vec::new(),
        }
    }
}

// ============================================
// StatusConfig
// ============================================

/// Status output configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Path of the status file; disabled when absent.
    #[serde(default)]
    pub file: Option<String>,

    /// Status format version (1, 2 or 3).
    #[serde(default = "default_status_version")]
    pub version: u8,

    /// Rewrite interval in seconds.
    #[serde(default = "default_status_interval")]
    pub interval_secs: u64,
}

const fn default_status_version() -> u8 {
    1
}

const fn default_status_interval() -> u64 {
    60
}

impl StatusConfig {
    fn validate(&self) -> Result<()> {
        if !(1..=3).contains(&self.version) {
            return Err(ServerError::config_invalid(
                "status.version",
                "must be 1, 2 or 3",
            ));
        }
        if self.interval_secs == 0 {
            return Err(ServerError::config_invalid(
                "status.interval_secs",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            file: None,
            version: default_status_version(),
            interval_secs: default_status_interval(),
        }
    }
}

// ============================================
// PoolConfig
// ============================================

/// Virtual-address pool persistence section.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolConfig {
    /// Path of the persistence file; assignments are not preserved
    /// across restarts when absent.
    #[serde(default)]
    pub persist_file: Option<String>,
}

// ============================================
// LoggingConfig
// ============================================

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.proto, WireProto::Udp);
        assert_eq!(config.tunnel.mode, TunnelKind::Tun);
    }

    #[test]
    fn test_full_config_format() {
        let toml = r#"
            [network]
            listen_addr = "0.0.0.0:1194"
            proto = "tcp"

            [tunnel]
            device_name = "warren0"
            mode = "tap"
            address_range = "10.9.0.0/24"
            gateway_ip = "10.9.0.1"
            mtu = 1400

            [limits]
            max_clients = 64
            tcp_queue_limit = 32
            session_timeout_secs = 60

            [routing]
            enable_c2c = true
            mroute_ageable_ttl_secs = 45

            [status]
            file = "/run/warren/status.log"
            version = 2
            interval_secs = 30

            [logging]
            level = "debug"
        "#;

        let config = ServerConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.network.proto, WireProto::Tcp);
        assert_eq!(config.tunnel.mode, TunnelKind::Tap);
        assert_eq!(config.limits.max_clients, 64);
        assert!(config.routing.enable_c2c);
        assert_eq!(config.routing.mroute_ageable_ttl_secs, 45);
        assert_eq!(config.status.version, 2);
    }

    #[test]
    fn test_parse_address_range() {
        let config = TunnelConfig::default();
        let (network, prefix) = config.parse_address_range().unwrap();

        assert_eq!(network, Ipv4Addr::new(10, 8, 0, 0));
        assert_eq!(prefix, 24);
    }

    #[test]
    fn test_invalid_address_range() {
        let mut config = TunnelConfig::default();
        config.address_range = "10.8.0.0".into();
        assert!(config.parse_address_range().is_err());

        config.address_range = "10.8.0.0/31".into();
        assert!(config.parse_address_range().is_err());
    }

    #[test]
    fn test_invalid_status_version() {
        let toml = r#"
            [status]
            version = 4
        "#;
        assert!(ServerConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_iroute_entries() {
        let toml = r#"
            [routing]
            iroutes = [{ network = "10.9.0.0/16", common_name = "peer-a" }]
        "#;
        let config = ServerConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.routing.iroutes.len(), 1);

        let (net, prefix) = config.routing.iroutes[0].parse_network().unwrap();
        assert_eq!(net, Ipv4Addr::new(10, 9, 0, 0));
        assert_eq!(prefix, 16);

        let bad = r#"
            [routing]
            iroutes = [{ network = "10.9.0.0", common_name = "peer-a" }]
        "#;
        assert!(ServerConfig::from_toml_str(bad).is_err());
    }

    #[test]
    fn test_reap_params_defaults() {
        let config = RoutingConfig::default();
        let params = config.reap_params();
        assert_eq!(params.max_wakeup_secs, 10);
        assert_eq!(params.divisor, 256);
        assert_eq!(params.min, 16);
        assert_eq!(params.max, 1024);
    }
}
