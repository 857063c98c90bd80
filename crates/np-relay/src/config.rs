//! Relay configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use np_core::Address;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// The relay's own address on the substrate.
    pub address: Address,
    /// Public IP advertised in allocation replies.
    pub public_ip: IpAddr,
    /// Local IP the per-allocation listeners bind to.
    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,
    /// Hex-dump relayed traffic at debug level.
    #[serde(default)]
    pub snoop: bool,
    /// Substrate connection URL.
    #[serde(default = "default_substrate_url")]
    pub substrate_url: String,
    /// Window from allocation to both sides authenticated.
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
}

fn default_bind_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_substrate_url() -> String {
    "mem://default".to_string()
}

fn default_auth_timeout_secs() -> u64 {
    np_core::timeouts::RENDEZVOUS_AUTH.as_secs()
}

impl RelayConfig {
    pub fn new(address: Address, public_ip: IpAddr) -> Self {
        Self {
            address,
            public_ip,
            bind_ip: default_bind_ip(),
            snoop: false,
            substrate_url: default_substrate_url(),
            auth_timeout_secs: default_auth_timeout_secs(),
        }
    }

    pub fn from_toml(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}
