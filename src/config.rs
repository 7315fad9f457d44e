//! Configuration for the mconnd daemon.
//!
//! TOML file with `[node]`, `[transport]`, `[mconn]`, `[[channels]]` and
//! `[logging]` sections. Missing fields fall back to defaults, so an empty
//! file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::network::endpoint::Endpoint;
use crate::network::filter::{ConnFilter, ConnectionRateFilter, DuplicateIpFilter, IpBlocklistFilter};
use crate::network::mconnection::{ChannelDescriptor, MConnConfig};
use crate::network::node_info::{NodeId, NodeInfo, NodeInfoOther, ProtocolVersion};
use crate::network::transport::TransportOptions;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Platform-specific data directory for mconnd.
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mconnd")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mconnd")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub mconn: MConnSection,
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelDescriptor>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            transport: TransportConfig::default(),
            mconn: MConnSection::default(),
            channels: default_channels(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_moniker")]
    pub moniker: String,
    /// Chain / network identifier peers must share.
    #[serde(default = "default_network")]
    pub network: String,
    /// Empty means `<data dir>/config/node_key.json`.
    #[serde(default)]
    pub node_key_file: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            moniker: default_moniker(),
            network: default_network(),
            node_key_file: String::new(),
        }
    }
}

fn default_moniker() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.split('.').next().unwrap_or(&h).to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "mconnd".to_string())
}

fn default_network() -> String {
    "testnet".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_filter_timeout_ms")]
    pub filter_timeout_ms: u64,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_incoming_connections: usize,
    /// Off by default: peers behind one NAT share an IP.
    #[serde(default)]
    pub filter_duplicate_ip: bool,
    /// IPs never accepted or dialled.
    #[serde(default)]
    pub blocked_peers: Vec<String>,
    /// 0 disables the per-IP rate filter.
    #[serde(default)]
    pub max_connections_per_ip_per_minute: u32,
    /// Endpoints dialled at startup.
    #[serde(default)]
    pub persistent_peers: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            dial_timeout_ms: default_dial_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            filter_timeout_ms: default_filter_timeout_ms(),
            max_incoming_connections: 0,
            filter_duplicate_ip: false,
            blocked_peers: Vec::new(),
            max_connections_per_ip_per_minute: 0,
            persistent_peers: Vec::new(),
        }
    }
}

fn default_listen_address() -> String {
    "mconn://0.0.0.0:26657".to_string()
}

fn default_dial_timeout_ms() -> u64 {
    1000
}

fn default_handshake_timeout_ms() -> u64 {
    3000
}

fn default_filter_timeout_ms() -> u64 {
    5000
}

/// The `[mconn]` section; durations in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MConnSection {
    #[serde(default = "default_rate")]
    pub send_rate: u64,
    #[serde(default = "default_rate")]
    pub recv_rate: u64,
    #[serde(default = "default_max_packet_msg_payload_size")]
    pub max_packet_msg_payload_size: usize,
    #[serde(default = "default_flush_throttle_ms")]
    pub flush_throttle_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl Default for MConnSection {
    fn default() -> Self {
        Self {
            send_rate: default_rate(),
            recv_rate: default_rate(),
            max_packet_msg_payload_size: default_max_packet_msg_payload_size(),
            flush_throttle_ms: default_flush_throttle_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

fn default_rate() -> u64 {
    MConnConfig::default().send_rate
}

fn default_max_packet_msg_payload_size() -> usize {
    1024
}

fn default_flush_throttle_ms() -> u64 {
    100
}

fn default_ping_interval_ms() -> u64 {
    60_000
}

fn default_pong_timeout_ms() -> u64 {
    45_000
}

fn default_send_timeout_ms() -> u64 {
    10_000
}

fn default_channels() -> Vec<ChannelDescriptor> {
    vec![ChannelDescriptor::new(0x01)
        .with_priority(1)
        .with_send_queue_capacity(16)
        .with_recv_message_capacity(1024 * 1024)]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Loads `path`, writing the defaults there first if it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load_from_file(path);
        }
        let config = Config::default();
        config.save_to_file(path)?;
        tracing::info!(path = %path.display(), "Created default config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::Invalid("at least one channel is required".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for ch in &self.channels {
            if !seen.insert(ch.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate channel id {:#04x}",
                    ch.id
                )));
            }
        }
        if self.mconn.max_packet_msg_payload_size == 0 {
            return Err(ConfigError::Invalid(
                "max_packet_msg_payload_size must be positive".into(),
            ));
        }
        self.listen_endpoint()?;
        self.blocked_ips()?;
        self.persistent_peers()?;
        Ok(())
    }

    pub fn listen_endpoint(&self) -> Result<Endpoint, ConfigError> {
        parse_endpoint(&self.transport.listen_address)
    }

    pub fn persistent_peers(&self) -> Result<Vec<Endpoint>, ConfigError> {
        self.transport
            .persistent_peers
            .iter()
            .map(|s| parse_endpoint(s))
            .collect()
    }

    fn blocked_ips(&self) -> Result<Vec<IpAddr>, ConfigError> {
        self.transport
            .blocked_peers
            .iter()
            .map(|s| {
                s.parse()
                    .map_err(|_| ConfigError::Invalid(format!("invalid blocked peer IP {:?}", s)))
            })
            .collect()
    }

    pub fn node_key_path(&self) -> PathBuf {
        if self.node.node_key_file.is_empty() {
            get_data_dir().join("config").join("node_key.json")
        } else {
            PathBuf::from(&self.node.node_key_file)
        }
    }

    pub fn mconn_config(&self) -> MConnConfig {
        let m = &self.mconn;
        MConnConfig {
            send_rate: m.send_rate,
            recv_rate: m.recv_rate,
            max_packet_msg_payload_size: m.max_packet_msg_payload_size,
            flush_throttle: Duration::from_millis(m.flush_throttle_ms),
            ping_interval: Duration::from_millis(m.ping_interval_ms),
            pong_timeout: Duration::from_millis(m.pong_timeout_ms),
            send_timeout: Duration::from_millis(m.send_timeout_ms),
        }
    }

    /// Transport options with the configured filter chain.
    pub fn transport_options(&self) -> Result<TransportOptions, ConfigError> {
        let t = &self.transport;
        let mut filters: Vec<Arc<dyn ConnFilter>> = Vec::new();
        if t.filter_duplicate_ip {
            filters.push(Arc::new(DuplicateIpFilter));
        }
        let blocked = self.blocked_ips()?;
        if !blocked.is_empty() {
            filters.push(Arc::new(IpBlocklistFilter::with_blocked(blocked)));
        }
        if t.max_connections_per_ip_per_minute > 0 {
            filters.push(Arc::new(ConnectionRateFilter::new(
                Duration::from_secs(60),
                t.max_connections_per_ip_per_minute,
            )));
        }

        Ok(TransportOptions::default()
            .with_max_incoming_connections(t.max_incoming_connections)
            .with_dial_timeout(Duration::from_millis(t.dial_timeout_ms))
            .with_handshake_timeout(Duration::from_millis(t.handshake_timeout_ms))
            .with_filter_timeout(Duration::from_millis(t.filter_timeout_ms))
            .with_conn_filters(filters))
    }

    /// The descriptor this node advertises during handshakes.
    pub fn node_info(&self, node_id: NodeId, listen_addr: &Endpoint) -> NodeInfo {
        let listen_addr = match listen_addr.socket_addr() {
            Some(addr) => addr.to_string(),
            None => listen_addr.to_string(),
        };
        NodeInfo {
            protocol_version: ProtocolVersion::current(),
            node_id,
            listen_addr,
            network: self.node.network.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            channels: self.channels.iter().map(|ch| ch.id).collect(),
            moniker: self.node.moniker.clone(),
            other: NodeInfoOther::default(),
        }
    }
}

fn parse_endpoint(s: &str) -> Result<Endpoint, ConfigError> {
    s.parse::<Endpoint>()
        .and_then(|e| e.normalize())
        .map_err(|e| ConfigError::Invalid(format!("endpoint {:?}: {}", s, e)))
}
