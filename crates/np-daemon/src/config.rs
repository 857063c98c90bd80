//! Daemon configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use np_core::{Address, DeviceName};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// The daemon's own address on the substrate.
    pub address: Address,
    /// Device name; forms the `<device>.sshnp` namespace.
    pub device: DeviceName,
    /// Allow-list of client addresses. Empty means any activated address
    /// may request sessions.
    #[serde(default)]
    pub managers: Vec<Address>,
    /// Port the local sshd listens on.
    #[serde(default = "default_sshd_port")]
    pub sshd_port: u16,
    /// Accept client-supplied SSH public keys (reverse mode).
    #[serde(default)]
    pub accept_client_keys: bool,
    /// Suppress the public device-info record.
    #[serde(default)]
    pub hidden: bool,
    /// Substrate connection URL.
    #[serde(default = "default_substrate_url")]
    pub substrate_url: String,
    /// Where to persist the authorised-key set on clean shutdown.
    #[serde(default)]
    pub authorized_keys_path: Option<PathBuf>,
}

fn default_sshd_port() -> u16 {
    22
}

fn default_substrate_url() -> String {
    "mem://default".to_string()
}

impl DaemonConfig {
    pub fn new(address: Address, device: DeviceName) -> Self {
        Self {
            address,
            device,
            managers: Vec::new(),
            sshd_port: default_sshd_port(),
            accept_client_keys: false,
            hidden: false,
            substrate_url: default_substrate_url(),
            authorized_keys_path: None,
        }
    }

    pub fn from_toml(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Whether `sender` may request sessions from this daemon.
    pub fn is_authorised(&self, sender: &Address) -> bool {
        self.managers.is_empty() || self.managers.contains(sender)
    }
}
