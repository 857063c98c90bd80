//! Relay server loop.
//!
//! Subscribes to allocation requests on the substrate, binds a listener
//! pair per session, replies `"<ip>,<portA>,<portB>,<nonce>"`, and runs
//! each allocation to completion in its own task. Allocations are
//! independent; one failing never affects another, and nothing survives a
//! restart.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use np_core::bridge::{self, BridgeConfig};
use np_core::protocol::{RvdAllocation, RvdRequest};
use np_core::{Address, DeviceName};
use np_crypto::{generate_nonce, KeyError, VerifyingKey};
use np_substrate::directory::DirectoryError;
use np_substrate::{keys as key_grammar, KeyDirectory, Notification, NotificationKey, Substrate, SubstrateError};

use crate::allocation::{Allocation, AllocationError, AllocationManager, Side};
use crate::auth::{authenticate_socket, AuthError};
use crate::config::RelayConfig;
use crate::metrics::RelayMetrics;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Substrate(#[from] SubstrateError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error("malformed allocation request: {0}")]
    MalformedRequest(String),
    #[error("unknown peers: {0}")]
    UnknownPeers(#[from] DirectoryError),
    #[error("no ports allocatable: {0}")]
    Exhausted(std::io::Error),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Key(#[from] KeyError),
}

pub struct RelayServer {
    config: RelayConfig,
    substrate: Arc<dyn Substrate>,
    directory: KeyDirectory,
    allocations: Arc<AllocationManager>,
    metrics: Arc<RelayMetrics>,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(config: RelayConfig, substrate: Arc<dyn Substrate>) -> Self {
        let metrics = Arc::new(RelayMetrics::new());
        let allocations = Arc::new(AllocationManager::new(metrics.clone()));
        let directory = KeyDirectory::new(substrate.clone());
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            substrate,
            directory,
            allocations,
            metrics,
            shutdown_tx,
        }
    }

    pub fn metrics(&self) -> Arc<RelayMetrics> {
        self.metrics.clone()
    }

    pub fn allocations(&self) -> Arc<AllocationManager> {
        self.allocations.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Serve allocation requests until shutdown.
    pub async fn run(&self) -> Result<(), RelayError> {
        let mut requests = self
            .substrate
            .subscribe(&self.config.address, &key_grammar::relay_subscription_pattern())
            .await?;
        info!(address = %self.config.address, ip = %self.config.public_ip, "rvd ready");

        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                notification = requests.next() => {
                    match notification {
                        Some(n) => {
                            if let Err(e) = self.handle_request(n).await {
                                warn!(error = %e, "allocation request rejected");
                            }
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("rvd shutting down");
        Ok(())
    }

    async fn handle_request(&self, notification: Notification) -> Result<(), RelayError> {
        let request: RvdRequest = serde_json::from_str(&notification.value)
            .map_err(|e| RelayError::MalformedRequest(e.to_string()))?;
        let device: DeviceName = notification
            .key
            .entry
            .parse()
            .map_err(|e| RelayError::MalformedRequest(format!("bad device name: {e}")))?;
        let client: Address = notification.key.from.clone();
        let daemon: Address = request.daemon_address.clone();

        // Both peers must resolve to verification keys before any port is
        // spent on them.
        let client_key = self.directory.verifying_key(&client).await?;
        let daemon_key = self.directory.verifying_key(&daemon).await?;

        let listener_a = TcpListener::bind((self.config.bind_ip, 0))
            .await
            .map_err(RelayError::Exhausted)?;
        let listener_b = TcpListener::bind((self.config.bind_ip, 0))
            .await
            .map_err(RelayError::Exhausted)?;
        let port_a = listener_a.local_addr()?.port();
        let port_b = listener_b.local_addr()?.port();

        let nonce = generate_nonce()?;
        let allocation =
            self.allocations
                .create(request.session_id, client.clone(), daemon, nonce.clone())?;

        let reply = RvdAllocation {
            ip: self.config.public_ip,
            port_a,
            port_b,
            nonce,
        };
        let reply_key =
            NotificationKey::rvd_reply(&client, &request.session_id, &device, &self.config.address);
        self.substrate.notify(&reply_key, &reply.to_string()).await?;
        info!(session = %request.session_id, port_a, port_b, "allocation ready");

        tokio::spawn(run_allocation(
            allocation,
            listener_a,
            listener_b,
            client_key,
            daemon_key,
            self.allocations.clone(),
            self.metrics.clone(),
            BridgeConfig {
                snoop: self.config.snoop,
                ..BridgeConfig::default()
            },
            self.config.auth_timeout(),
        ));
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_allocation(
    allocation: Arc<Allocation>,
    listener_a: TcpListener,
    listener_b: TcpListener,
    client_key: VerifyingKey,
    daemon_key: VerifyingKey,
    allocations: Arc<AllocationManager>,
    metrics: Arc<RelayMetrics>,
    bridge_config: BridgeConfig,
    auth_timeout: Duration,
) {
    let session = allocation.session_id;

    // The two handshakes are independent; neither gates the other. The
    // splice starts only once both have succeeded, and the whole window is
    // bounded so a half-connected allocation cannot pin its ports.
    let authed = tokio::time::timeout(auth_timeout, async {
        tokio::try_join!(
            accept_and_auth(listener_a, Side::Client, &allocation, &client_key, &metrics),
            accept_and_auth(listener_b, Side::Daemon, &allocation, &daemon_key, &metrics),
        )
    })
    .await;

    match authed {
        Ok(Ok((client_socket, daemon_socket))) => {
            info!(session = %session, "both sides authenticated, splicing");
            metrics.sessions_spliced.fetch_add(1, Ordering::Relaxed);
            match bridge::splice(
                &session.to_string(),
                client_socket,
                daemon_socket,
                &bridge_config,
            )
            .await
            {
                Ok((a_to_b, b_to_a)) => {
                    metrics
                        .bytes_relayed
                        .fetch_add(a_to_b + b_to_a, Ordering::Relaxed);
                    info!(session = %session, a_to_b, b_to_a, "splice finished");
                }
                Err(e) => warn!(session = %session, error = %e, "splice aborted"),
            }
        }
        Ok(Err(e)) => warn!(session = %session, error = %e, "rendezvous auth failed, tearing down"),
        Err(_) => warn!(session = %session, "rendezvous auth window expired"),
    }

    allocations.close(&session);
}

async fn accept_and_auth(
    listener: TcpListener,
    side: Side,
    allocation: &Allocation,
    expected_key: &VerifyingKey,
    metrics: &RelayMetrics,
) -> Result<BufReader<TcpStream>, RelayError> {
    let (stream, peer) = listener.accept().await?;
    // Exactly one socket per listener.
    drop(listener);
    debug!(session = %allocation.session_id, ?side, %peer, "rendezvous socket accepted");

    match authenticate_socket(stream, side, allocation, expected_key).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            metrics.auth_failures.fetch_add(1, Ordering::Relaxed);
            Err(e.into())
        }
    }
}
