//! CLI definition and mapping onto [`ClientConfig`].

use std::path::PathBuf;

use clap::Parser;

use np_core::{Address, DeviceName};
use np_crypto::SshKeyAlgo;

use crate::config::{default_state_dir, ClientConfig, SshClientMode};

/// NoPorts client: SSH to a device with no open inbound ports.
//
// `-h` is taken by `--host`, so the short help flag is disabled and help
// is `--help` only.
#[derive(Parser, Debug)]
#[command(name = "np")]
#[command(version, about = "SSH to a device with no open inbound ports")]
#[command(disable_help_flag = true)]
pub struct Cli {
    /// This client's address on the substrate
    #[arg(short = 'f', long)]
    pub from: String,

    /// The daemon's address
    #[arg(short = 't', long)]
    pub to: String,

    /// Device name under the daemon's address
    #[arg(short = 'd', long, default_value = "default")]
    pub device: String,

    /// `@rvdAddress` for a rendezvous, or a public IP for legacy reverse
    #[arg(short = 'h', long, default_value = "")]
    pub host: String,

    /// Reverse mode: SSH port on this host the daemon dials back to
    #[arg(short = 'p', long, default_value_t = 22)]
    pub port: u16,

    /// Local tunnel port (0 selects an ephemeral port)
    #[arg(short = 'l', long = "local-port", default_value_t = 0)]
    pub local_port: u16,

    /// Use an existing SSH identity instead of a per-session key
    #[arg(short = 'i', long = "identity-file")]
    pub identity_file: Option<PathBuf>,

    /// Generate the ephemeral keypair locally and send the public key
    #[arg(short = 's', long = "send-ssh-public-key")]
    pub send_ssh_public_key: bool,

    /// Extra `-o` options for the emitted ssh command (repeatable)
    #[arg(short = 'o', long = "local-ssh-options")]
    pub local_ssh_options: Vec<String>,

    /// Also apply the `-o` options to the tunnel ssh in exec mode
    #[arg(long = "add-forwards-to-tunnel")]
    pub add_forwards_to_tunnel: bool,

    /// Device-side login name (otherwise resolved from the shared record)
    #[arg(short = 'u', long = "remote-user-name")]
    pub remote_username: Option<String>,

    /// How to drive the post-establishment SSH
    #[arg(long = "ssh-client", default_value = "embedded")]
    pub ssh_client: String,

    /// Ephemeral key algorithm
    #[arg(long = "ssh-algo", default_value = "ed25519")]
    pub ssh_algo: String,

    /// Force the legacy reverse strategy
    #[arg(long = "legacy-daemon")]
    pub legacy_daemon: bool,

    /// List the daemon's devices and exit
    #[arg(long = "list-devices")]
    pub list_devices: bool,

    /// Substrate URL (falls back to $NP_SUBSTRATE)
    #[arg(long)]
    pub substrate: Option<String>,

    /// TTL for short-lived shared records, in milliseconds
    #[arg(long = "response-ttl-ms", default_value_t = 10_000)]
    pub response_ttl_ms: u64,

    /// Long-term signing keyfile; generated on first run
    #[arg(long = "key-file")]
    pub key_file: Option<PathBuf>,

    /// Verbose logging
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Print help
    #[arg(long, action = clap::ArgAction::Help)]
    pub help: Option<bool>,
}

impl Cli {
    /// Validate flags into a [`ClientConfig`]. Everything rejected here is
    /// a usage error (exit code 1).
    pub fn into_config(self) -> Result<ClientConfig, String> {
        let client_address: Address = self
            .from
            .parse()
            .map_err(|e| format!("--from: {e}"))?;
        let daemon_address: Address = self.to.parse().map_err(|e| format!("--to: {e}"))?;
        let device: DeviceName = self.device.parse().map_err(|e| format!("--device: {e}"))?;
        if self.host.is_empty() && !self.list_devices {
            return Err("--host is required (an @rvd address or a public IP)".to_string());
        }
        let ssh_client: SshClientMode = self.ssh_client.parse().map_err(|e| format!("--ssh-client: {e}"))?;
        let ssh_algo: SshKeyAlgo = self.ssh_algo.parse().map_err(|e| format!("--ssh-algo: {e}"))?;

        let mut config = ClientConfig::new(client_address, daemon_address, device, self.host);
        config.port = self.port;
        config.local_port = self.local_port;
        config.remote_username = self.remote_username;
        config.identity_file = self.identity_file;
        config.send_ssh_public_key = self.send_ssh_public_key;
        config.local_ssh_options = self.local_ssh_options;
        config.add_forwards_to_tunnel = self.add_forwards_to_tunnel;
        config.ssh_client = ssh_client;
        config.ssh_algo = ssh_algo;
        config.legacy_daemon = self.legacy_daemon;
        config.response_ttl_ms = self.response_ttl_ms;
        config.substrate_url = self
            .substrate
            .or_else(|| std::env::var("NP_SUBSTRATE").ok())
            .unwrap_or_else(|| "mem://default".to_string());
        config.state_dir = default_state_dir();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn short_flags_map_to_the_documented_options() {
        let cli = parse(&[
            "np", "-f", "@alice", "-t", "@bob", "-d", "office", "-h", "@rvd", "-l", "2222",
            "-v",
        ]);
        assert_eq!(cli.from, "@alice");
        assert_eq!(cli.host, "@rvd");
        assert_eq!(cli.local_port, 2222);
        assert!(cli.verbose);

        let config = cli.into_config().unwrap();
        assert_eq!(config.device.as_str(), "office");
        assert!(config.rendezvous_address().is_some());
    }

    #[test]
    fn invalid_device_name_is_a_usage_error() {
        let cli = parse(&["np", "-f", "@alice", "-t", "@bob", "-d", "not valid!", "-h", "@rvd"]);
        assert!(cli.into_config().is_err());
    }

    #[test]
    fn missing_host_is_a_usage_error_unless_listing() {
        let cli = parse(&["np", "-f", "@alice", "-t", "@bob"]);
        assert!(cli.into_config().is_err());

        let cli = parse(&["np", "-f", "@alice", "-t", "@bob", "--list-devices"]);
        assert!(cli.into_config().is_ok());
    }

    #[test]
    fn repeatable_ssh_options_accumulate() {
        let cli = parse(&[
            "np", "-f", "@alice", "-t", "@bob", "-h", "@rvd", "-o", "ForwardAgent=no", "-o",
            "ServerAliveInterval=30",
        ]);
        assert_eq!(cli.local_ssh_options.len(), 2);
    }
}
