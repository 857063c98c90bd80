//! np: NoPorts client binary.

use std::path::PathBuf;

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use np_client::{
    discovery, Cli, ClientConfig, ExitCode, SessionError, SessionOrchestrator, SessionOutcome,
    SshClientMode,
};
use np_core::timeouts;
use np_crypto::{PublicKeyRecord, SigningAlgo, SigningKeypair};
use np_substrate::Substrate;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Usage errors are exit code 1 (clap would default to 2).
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let kind = e.kind();
            let _ = e.print();
            return if matches!(kind, ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                ExitCode::Success.to_exit_code()
            } else {
                ExitCode::Usage.to_exit_code()
            };
        }
    };

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let list_devices = cli.list_devices;
    let key_file = cli.key_file.clone();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("np: {message}");
            return ExitCode::Usage.to_exit_code();
        }
    };

    match run(config, key_file, list_devices).await {
        Ok(code) => code.to_exit_code(),
        Err(e) => {
            let code = e.exit_code();
            debug!(exit = code.name(), "session failed");
            eprintln!("np: {e}");
            code.to_exit_code()
        }
    }
}

async fn run(
    config: ClientConfig,
    key_file: Option<PathBuf>,
    list_devices: bool,
) -> Result<ExitCode, SessionError> {
    let substrate = np_substrate::connect(&config.substrate_url)?;

    let keypair = load_or_generate_keypair(&key_file, &config)?;
    let record = serde_json::to_string(&PublicKeyRecord::for_keypair(&keypair)?)?;
    substrate
        .register_principal(&config.client_address, &record)
        .await?;

    if list_devices {
        let list = discovery::list_devices(
            substrate.as_ref(),
            &config.client_address,
            &config.daemon_address,
            timeouts::DEVICE_PING,
        )
        .await
        .map_err(|e| match e {
            discovery::DiscoveryError::Substrate(e) => SessionError::from(e),
        })?;
        print!("{}", discovery::render(&list));
        return Ok(ExitCode::Success);
    }

    let ssh_client = config.ssh_client;
    let ssh_options = config.local_ssh_options.clone();
    let add_forwards = config.add_forwards_to_tunnel;

    let orchestrator = SessionOrchestrator::new(config, substrate, keypair);
    let cleanup = orchestrator.cleanup();

    let outcome = tokio::select! {
        result = orchestrator.run() => match result {
            Ok(outcome) => outcome,
            Err(e) => {
                cleanup.run().await;
                return Err(e);
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted during establishment");
            cleanup.run().await;
            return Ok(ExitCode::Interrupted);
        }
    };

    // The one line a wrapper script can consume.
    println!("{}", outcome.ssh_command);

    let code = match ssh_client {
        SshClientMode::Exec => drive_exec(&outcome, &ssh_options, add_forwards).await,
        SshClientMode::Embedded => wait_embedded(outcome).await,
    };
    cleanup.run().await;
    code
}

fn load_or_generate_keypair(
    key_file: &Option<PathBuf>,
    config: &ClientConfig,
) -> Result<SigningKeypair, SessionError> {
    let path = match key_file {
        Some(path) => path.clone(),
        None => {
            std::fs::create_dir_all(&config.state_dir).map_err(np_crypto::KeyError::from)?;
            config
                .state_dir
                .join(format!("{}_key.json", config.client_address.name()))
        }
    };
    if path.exists() {
        Ok(SigningKeypair::load(&path)?)
    } else {
        let keypair = SigningKeypair::generate(SigningAlgo::Ed25519)?;
        keypair.save(&path)?;
        info!(path = %path.display(), "generated new signing keypair");
        Ok(keypair)
    }
}

/// Exec mode: hand the established tunnel to the system `ssh`.
async fn drive_exec(
    outcome: &SessionOutcome,
    options: &[String],
    add_forwards: bool,
) -> Result<ExitCode, SessionError> {
    let mut command = tokio::process::Command::new("ssh");
    command.arg("-p").arg(outcome.local_port.to_string());
    if let Some(identity) = &outcome.identity_file {
        command.arg("-i").arg(identity);
    }
    if add_forwards {
        for option in options {
            command.arg("-o").arg(option);
        }
    }
    match &outcome.username {
        Some(username) => command.arg(format!("{username}@localhost")),
        None => command.arg("localhost"),
    };

    let mut child = command.kill_on_drop(true).spawn()?;
    tokio::select! {
        status = child.wait() => {
            let status = status?;
            Ok(if status.success() {
                ExitCode::Success
            } else {
                ExitCode::Remote
            })
        }
        _ = tokio::signal::ctrl_c() => Ok(ExitCode::Interrupted),
    }
}

/// Embedded mode: serve the tunnel until it drains or SIGINT.
async fn wait_embedded(outcome: SessionOutcome) -> Result<ExitCode, SessionError> {
    let Some(tunnel) = outcome.tunnel else {
        // Reverse mode: the daemon's ssh owns the data plane.
        return Ok(ExitCode::Success);
    };
    tokio::select! {
        result = tunnel => {
            match result {
                Ok(Ok((sent, received))) => info!(sent, received, "tunnel closed"),
                Ok(Err(e)) => warn!(error = %e, "tunnel failed"),
                Err(e) => warn!(error = %e, "tunnel task panicked"),
            }
            Ok(ExitCode::Success)
        }
        _ = tokio::signal::ctrl_c() => Ok(ExitCode::Interrupted),
    }
}
