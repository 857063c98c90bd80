//! Client configuration.

use std::path::PathBuf;
use std::str::FromStr;

use np_core::{Address, DeviceName};
use np_crypto::SshKeyAlgo;

/// How the post-establishment SSH is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SshClientMode {
    /// Spawn the system `ssh` against the local tunnel port.
    Exec,
    /// Serve the local port natively and only print the `ssh` command.
    #[default]
    Embedded,
}

impl FromStr for SshClientMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exec" => Ok(Self::Exec),
            "embedded" => Ok(Self::Embedded),
            other => Err(format!("unsupported ssh client mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The client's own address on the substrate.
    pub client_address: Address,
    /// The daemon's address.
    pub daemon_address: Address,
    /// Target device name under the daemon address.
    pub device: DeviceName,
    /// `@rvdAddress` to use a rendezvous, or a public IP for the legacy
    /// reverse path.
    pub host: String,
    /// Reverse mode: SSH port on the client host the daemon dials back to.
    pub port: u16,
    /// Local tunnel port; 0 selects an ephemeral port.
    pub local_port: u16,
    /// Override for the device-side login name.
    pub remote_username: Option<String>,
    /// Pre-existing SSH identity instead of a per-session key.
    pub identity_file: Option<PathBuf>,
    /// Generate the ephemeral keypair client-side and send the public key.
    pub send_ssh_public_key: bool,
    /// Extra `-o` options for the emitted ssh command.
    pub local_ssh_options: Vec<String>,
    /// Also apply `local_ssh_options` to the tunnel ssh in exec mode.
    pub add_forwards_to_tunnel: bool,
    pub ssh_client: SshClientMode,
    pub ssh_algo: SshKeyAlgo,
    /// Force the legacy reverse strategy regardless of daemon features.
    pub legacy_daemon: bool,
    /// Substrate connection URL.
    pub substrate_url: String,
    /// TTL for short-lived shared records, in milliseconds.
    pub response_ttl_ms: u64,
    /// Directory for per-session state (`<state_dir>/<sessionId>/`).
    pub state_dir: PathBuf,
}

impl ClientConfig {
    pub fn new(
        client_address: Address,
        daemon_address: Address,
        device: DeviceName,
        host: impl Into<String>,
    ) -> Self {
        Self {
            client_address,
            daemon_address,
            device,
            host: host.into(),
            port: 22,
            local_port: 0,
            remote_username: None,
            identity_file: None,
            send_ssh_public_key: false,
            local_ssh_options: Vec::new(),
            add_forwards_to_tunnel: false,
            ssh_client: SshClientMode::default(),
            ssh_algo: SshKeyAlgo::default(),
            legacy_daemon: false,
            substrate_url: "mem://default".to_string(),
            response_ttl_ms: 10_000,
            state_dir: default_state_dir(),
        }
    }

    /// A `@`-prefixed host selects the rendezvous path.
    pub fn rendezvous_address(&self) -> Option<Result<Address, np_core::AddressError>> {
        self.host.starts_with('@').then(|| self.host.parse())
    }
}

/// `$HOME/.sshnp`, falling back to the system temp dir.
pub fn default_state_dir() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".sshnp"),
        Err(_) => std::env::temp_dir().join("sshnp"),
    }
}
