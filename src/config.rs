//! WolfMesh Configuration
//!
//! This module provides configuration structures for a WolfMesh node.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::network::{InboundConfig, LinkProtocol, OutboundConfig, DEFAULT_BACKOFF_MS};
use crate::topology::Node;

/// Main WolfMesh configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WolfMeshConfig {
    /// Node identity and listening port
    #[serde(default)]
    pub node: NodeConfig,

    /// Bootstrap and membership settings
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Link transport settings
    #[serde(default)]
    pub link: LinkConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier (defaults to `address:port`)
    #[serde(default)]
    pub id: Option<String>,

    /// Address advertised to other nodes
    #[serde(default = "default_address")]
    pub address: String,

    /// Address to bind the listener on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port for links and the HTTP API (0 = ephemeral)
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// HTTP base URLs of nodes to fetch the topology from
    #[serde(default)]
    pub bootstraps: Vec<String>,

    /// Passes over the bootstrap list before running as master
    #[serde(default = "default_boot_max_retries")]
    pub boot_max_retries: u32,

    /// Pause between passes over the bootstrap list
    #[serde(default = "default_boot_retry_delay_ms")]
    pub boot_retry_delay_ms: u64,

    /// Timeout of a single bootstrap request
    #[serde(default = "default_boot_request_timeout_ms")]
    pub boot_request_timeout_ms: u64,

    /// Delays between reconnect attempts to the master
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: Vec<u64>,

    /// Time a new link gets to identify itself
    #[serde(default = "default_registration_timeout_ms")]
    pub registration_timeout_ms: u64,

    /// Debounce delay for topology syncs (0 = next loop turn)
    #[serde(default)]
    pub sync_delay_ms: u64,
}

/// Link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Accepted protocols in preference order
    #[serde(default = "default_protocols")]
    pub protocols: Vec<LinkProtocol>,

    /// Protocol offered when dialing
    #[serde(default = "default_outbound_protocol")]
    pub outbound_protocol: LinkProtocol,

    /// Frames buffered per link while the writer is busy (0 = no queue)
    #[serde(default = "default_send_queue_max")]
    pub send_queue_max: usize,

    /// Connect plus handshake timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Drop links that stay silent this long
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7400
}

fn default_boot_max_retries() -> u32 {
    5
}

fn default_boot_retry_delay_ms() -> u64 {
    1000
}

fn default_boot_request_timeout_ms() -> u64 {
    3000
}

fn default_reconnect_backoff_ms() -> Vec<u64> {
    DEFAULT_BACKOFF_MS.to_vec()
}

fn default_registration_timeout_ms() -> u64 {
    3000
}

fn default_protocols() -> Vec<LinkProtocol> {
    LinkProtocol::ALL.to_vec()
}

fn default_outbound_protocol() -> LinkProtocol {
    LinkProtocol::Json
}

fn default_send_queue_max() -> usize {
    1024
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            address: default_address(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bootstraps: Vec::new(),
            boot_max_retries: default_boot_max_retries(),
            boot_retry_delay_ms: default_boot_retry_delay_ms(),
            boot_request_timeout_ms: default_boot_request_timeout_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            registration_timeout_ms: default_registration_timeout_ms(),
            sync_delay_ms: 0,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            protocols: default_protocols(),
            outbound_protocol: default_outbound_protocol(),
            send_queue_max: default_send_queue_max(),
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_timeout_ms: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfMeshConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfMeshConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfMeshConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if matches!(&self.node.id, Some(id) if id.is_empty()) {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.address.is_empty() {
            return Err(crate::Error::Config("node.address cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        for bootstrap in &self.cluster.bootstraps {
            if !(bootstrap.starts_with("http://") || bootstrap.starts_with("https://")) {
                return Err(crate::Error::Config(format!(
                    "cluster.bootstraps entry {:?} must start with http:// or https://",
                    bootstrap
                )));
            }
        }

        if self.cluster.reconnect_backoff_ms.is_empty() {
            return Err(crate::Error::Config("cluster.reconnect_backoff_ms cannot be empty".into()));
        }

        if self.cluster.registration_timeout_ms == 0 {
            return Err(crate::Error::Config("cluster.registration_timeout_ms must be positive".into()));
        }

        if self.link.protocols.is_empty() {
            return Err(crate::Error::Config("link.protocols cannot be empty".into()));
        }

        Ok(())
    }

    /// Node id, falling back to `address:port`
    pub fn node_id(&self, port: u16) -> String {
        match &self.node.id {
            Some(id) => id.clone(),
            None => format!("{}:{}", self.node.address, port),
        }
    }

    /// Identity of this node once the listener port is known
    pub fn local_node(&self, port: u16) -> crate::Result<Node> {
        Node::new(self.node_id(port), self.node.address.clone(), port)
    }

    /// Get the listener bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.node.bind_address, self.node.port)
    }

    /// Get boot retry delay as Duration
    pub fn boot_retry_delay(&self) -> Duration {
        Duration::from_millis(self.cluster.boot_retry_delay_ms)
    }

    /// Get bootstrap request timeout as Duration
    pub fn boot_request_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.boot_request_timeout_ms)
    }

    /// Get registration timeout as Duration
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.registration_timeout_ms)
    }

    /// Get sync debounce delay as Duration
    pub fn sync_delay(&self) -> Duration {
        Duration::from_millis(self.cluster.sync_delay_ms)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.link.connect_timeout_ms)
    }

    /// Settings for links dialed by this node
    pub fn outbound(&self) -> OutboundConfig {
        OutboundConfig {
            protocol: self.link.outbound_protocol,
            backoff: self.cluster.reconnect_backoff_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
            connect_timeout: self.connect_timeout(),
            send_queue_max: self.link.send_queue_max,
            idle_timeout: self.link.idle_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Settings for links accepted by this node
    pub fn inbound(&self) -> InboundConfig {
        InboundConfig {
            registration_timeout: self.registration_timeout(),
            send_queue_max: self.link.send_queue_max,
            idle_timeout: self.link.idle_timeout_ms.map(Duration::from_millis),
        }
    }
}
