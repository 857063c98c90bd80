//! rvd: NoPorts rendezvous relay binary.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use np_core::Address;
use np_relay::{RelayConfig, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "rvd")]
#[command(version, about = "NoPorts rendezvous relay")]
struct Args {
    /// The relay's address on the substrate
    #[arg(long, required_unless_present = "config")]
    atsign: Option<String>,

    /// Public IP advertised to peers
    #[arg(long, required_unless_present = "config")]
    ip: Option<IpAddr>,

    /// TOML config file; flags below still override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hex-dump relayed traffic (never alters bytes)
    #[arg(long)]
    snoop: bool,

    /// Local IP the allocated listeners bind to
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Substrate URL (falls back to $NP_SUBSTRATE)
    #[arg(long)]
    substrate: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn build_config(args: &Args) -> anyhow::Result<RelayConfig> {
    let mut config = match &args.config {
        Some(path) => RelayConfig::from_toml(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let address: Address = args
                .atsign
                .as_deref()
                .context("--atsign is required")?
                .parse()
                .context("invalid --atsign")?;
            let ip = args.ip.context("--ip is required")?;
            RelayConfig::new(address, ip)
        }
    };

    if let Some(bind) = args.bind {
        config.bind_ip = bind;
    }
    if args.snoop {
        config.snoop = true;
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
    let substrate = np_substrate::connect(&config.substrate_url)
        .context("could not open substrate connection")?;

    let server = RelayServer::new(config, substrate);

    tokio::select! {
        result = server.run() => result.context("relay failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            server.shutdown();
        }
    }
    Ok(())
}
