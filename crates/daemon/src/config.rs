//! Daemon configuration

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use wgrelay_common::{Error, Result};

/// Relay daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Server identity and API listener
    pub server: ServerConfig,

    /// WireGuard interface configuration
    pub wireguard: WireguardConfig,

    /// API authentication
    pub auth: AuthConfig,

    /// Reconciliation configuration
    pub reconcile: ReconcileConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            store_path: wgrelay_common::default_store_path(),
            server: ServerConfig::default(),
            wireguard: WireguardConfig::default(),
            auth: AuthConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

/// Server identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Human-readable relay name
    pub name: String,

    /// Public IP clients connect to
    pub public_ip: String,

    /// HTTP API listen port
    pub api_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "vpn-relay".to_string(),
            public_ip: "0.0.0.0".to_string(),
            api_port: 8443,
        }
    }
}

/// WireGuard-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireguardConfig {
    /// Interface name the runtime manages
    pub interface: String,

    /// UDP port the tunnel listens on
    pub listen_port: u16,

    /// Peer address pool in CIDR notation; the first host is the relay
    pub subnet: String,

    /// DNS servers pushed to clients
    pub dns: String,

    /// PersistentKeepalive interval in seconds
    pub keepalive: u16,

    /// Timeout for runtime control calls, in seconds
    pub control_timeout_secs: u64,
}

impl Default for WireguardConfig {
    fn default() -> Self {
        Self {
            interface: "wg0".to_string(),
            listen_port: 51820,
            subnet: "10.8.0.0/24".to_string(),
            dns: "1.1.1.1, 1.0.0.1".to_string(),
            keepalive: 25,
            control_timeout_secs: 5,
        }
    }
}

/// API authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared bearer secret for the provisioning endpoints
    pub api_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_secret: String::new(),
        }
    }
}

/// Reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Interval between periodic reconciliation passes, in seconds
    pub interval_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl RelayConfig {
    /// Load configuration from file, falling back to defaults if absent
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `WGRELAY_*` environment overrides on top of the loaded file
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WGRELAY_SERVER_NAME") {
            self.server.name = v;
        }
        if let Ok(v) = std::env::var("WGRELAY_SERVER_IP") {
            self.server.public_ip = v;
        }
        if let Ok(v) = std::env::var("WGRELAY_API_PORT") {
            if let Ok(port) = v.parse() {
                self.server.api_port = port;
            }
        }
        if let Ok(v) = std::env::var("WGRELAY_SUBNET") {
            self.wireguard.subnet = v;
        }
        if let Ok(v) = std::env::var("WGRELAY_DNS") {
            self.wireguard.dns = v;
        }
        if let Ok(v) = std::env::var("WGRELAY_INTERFACE") {
            self.wireguard.interface = v;
        }
        if let Ok(v) = std::env::var("WGRELAY_API_SECRET") {
            self.auth.api_secret = v;
        }
    }

    /// Parse the configured peer subnet
    pub fn subnet(&self) -> Result<Ipv4Network> {
        self.wireguard
            .subnet
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("bad subnet {:?}: {}", self.wireguard.subnet, e)))
    }

    /// The relay's own tunnel address: first host in the subnet
    pub fn relay_address(&self) -> Result<Ipv4Addr> {
        let net = self.subnet()?;
        let first_host = u32::from(net.network()) + 1;
        let addr = Ipv4Addr::from(first_host);
        if !net.contains(addr) {
            return Err(Error::InvalidConfig(format!(
                "subnet {} has no usable host addresses",
                net
            )));
        }
        Ok(addr)
    }

    /// Tunnel endpoint clients dial, `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.server.public_ip, self.wireguard.listen_port)
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("peers.db")
    }

    /// Validate settings that would otherwise fail deep inside a request
    pub fn validate(&self) -> Result<()> {
        let net = self.subnet()?;
        if net.prefix() > 30 {
            return Err(Error::InvalidConfig(format!(
                "subnet /{} leaves no room for peers",
                net.prefix()
            )));
        }
        if self.auth.api_secret.is_empty() {
            return Err(Error::InvalidConfig(
                "auth.api_secret must be set (WGRELAY_API_SECRET)".to_string(),
            ));
        }
        Ok(())
    }
}
