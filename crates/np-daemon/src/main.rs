//! npd: NoPorts device daemon binary.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use np_core::{Address, DeviceName};
use np_crypto::{SigningAlgo, SigningKeypair};
use np_daemon::{DaemonConfig, DaemonController};

#[derive(Parser, Debug)]
#[command(name = "npd")]
#[command(version, about = "NoPorts device daemon")]
struct Args {
    /// The daemon's address on the substrate
    #[arg(long, required_unless_present = "config")]
    atsign: Option<String>,

    /// Device name (ASCII `[A-Za-z0-9_]{1,15}`)
    #[arg(long, required_unless_present = "config")]
    device: Option<String>,

    /// TOML config file; flags below still override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Allow-listed manager addresses (repeatable); empty allows any
    /// activated address
    #[arg(long = "manager")]
    managers: Vec<String>,

    /// Accept client-supplied SSH public keys (legacy reverse mode)
    #[arg(long = "sshpublickey")]
    ssh_public_key: bool,

    /// Do not publish the device-info record
    #[arg(long)]
    hide: bool,

    /// Re-publish the device-info record (overrides --hide)
    #[arg(long = "un-hide")]
    un_hide: bool,

    /// Port the local sshd listens on
    #[arg(long)]
    sshd_port: Option<u16>,

    /// Long-term signing keyfile; generated on first run
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Persist the authorised-key set here on clean shutdown
    #[arg(long)]
    authorized_keys: Option<PathBuf>,

    /// Substrate URL (falls back to $NP_SUBSTRATE)
    #[arg(long)]
    substrate: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn build_config(args: &Args) -> anyhow::Result<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_toml(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let address: Address = args
                .atsign
                .as_deref()
                .context("--atsign is required")?
                .parse()
                .context("invalid --atsign")?;
            let device: DeviceName = args
                .device
                .as_deref()
                .context("--device is required")?
                .parse()
                .context("invalid --device")?;
            DaemonConfig::new(address, device)
        }
    };

    if !args.managers.is_empty() {
        config.managers = args
            .managers
            .iter()
            .map(|m| m.parse::<Address>())
            .collect::<Result<Vec<_>, _>>()
            .context("invalid --manager")?;
    }
    if let Some(port) = args.sshd_port {
        config.sshd_port = port;
    }
    if args.ssh_public_key {
        config.accept_client_keys = true;
    }
    if args.hide {
        config.hidden = true;
    }
    if args.un_hide {
        config.hidden = false;
    }
    if args.authorized_keys.is_some() {
        config.authorized_keys_path = args.authorized_keys.clone();
    }
    if let Some(substrate) = args
        .substrate
        .clone()
        .or_else(|| std::env::var("NP_SUBSTRATE").ok())
    {
        config.substrate_url = substrate;
    }
    Ok(config)
}

fn load_or_generate_keypair(
    key_file: &Option<PathBuf>,
    address: &Address,
) -> anyhow::Result<SigningKeypair> {
    let path = match key_file {
        Some(path) => path.clone(),
        None => {
            let home = std::env::var("HOME").context("HOME not set and no --key-file given")?;
            let dir = PathBuf::from(home).join(".sshnp");
            std::fs::create_dir_all(&dir)?;
            dir.join(format!("{}_key.json", address.name()))
        }
    };
    if path.exists() {
        SigningKeypair::load(&path).with_context(|| format!("loading {}", path.display()))
    } else {
        let keypair = SigningKeypair::generate(SigningAlgo::Ed25519)?;
        keypair
            .save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "generated new signing keypair");
        Ok(keypair)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = build_config(&args)?;
    let keypair = load_or_generate_keypair(&args.key_file, &config.address)?;
    let substrate = np_substrate::connect(&config.substrate_url)
        .context("could not open substrate connection")?;

    let persist_path = config.authorized_keys_path.clone();
    let controller = DaemonController::new(config, substrate, keypair);

    tokio::select! {
        result = controller.run() => result.context("daemon failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            controller.shutdown();
        }
    }

    // Clean shutdown is the only time the authorised set touches disk.
    if let Some(path) = persist_path {
        controller
            .authorized()
            .persist(&path)
            .await
            .with_context(|| format!("persisting {}", path.display()))?;
    }
    Ok(())
}
