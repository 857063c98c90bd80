//! Daemon controller loop.
//!
//! Subscribes to the device's request namespace, authorises senders
//! against the allow-list before anything is parsed, and runs each
//! accepted request in its own task. A failing session publishes an error
//! envelope and runs its cleanups; the controller keeps serving.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use np_core::bridge::{self, BridgeConfig};
use np_core::protocol::{ResponsePayload, SessionRequest, SessionStatus};
use np_core::{Address, CleanupRegistry, SessionId};
use np_crypto::{HashingAlgo, PublicKeyRecord, SignedEnvelope, SigningKeypair};
use np_substrate::keys::daemon_subscription_pattern;
use np_substrate::{Notification, NotificationKey, Substrate, SubstrateError};

use crate::authorized_keys::AuthorizedKeySet;
use crate::config::DaemonConfig;
use crate::handlers::{self, DataPlane, SessionContext};
use crate::heartbeat;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Substrate(#[from] SubstrateError),
    #[error(transparent)]
    Key(#[from] np_crypto::KeyError),
    #[error(transparent)]
    Envelope(#[from] np_crypto::EnvelopeError),
    #[error("serialisation: {0}")]
    Json(#[from] serde_json::Error),
}

/// Process-local counters, mostly for tests and logs.
#[derive(Debug, Default)]
pub struct DaemonMetrics {
    pub dropped_requests: AtomicU64,
    pub sessions_started: AtomicU64,
    pub sessions_failed: AtomicU64,
}

impl DaemonMetrics {
    pub fn dropped_requests(&self) -> u64 {
        self.dropped_requests.load(Ordering::Relaxed)
    }
}

pub struct DaemonController {
    config: Arc<DaemonConfig>,
    substrate: Arc<dyn Substrate>,
    keypair: Arc<SigningKeypair>,
    authorized: Arc<AuthorizedKeySet>,
    metrics: Arc<DaemonMetrics>,
    shutdown_tx: watch::Sender<bool>,
}

impl DaemonController {
    pub fn new(
        config: DaemonConfig,
        substrate: Arc<dyn Substrate>,
        keypair: SigningKeypair,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            substrate,
            keypair: Arc::new(keypair),
            authorized: Arc::new(AuthorizedKeySet::new()),
            metrics: Arc::new(DaemonMetrics::default()),
            shutdown_tx,
        }
    }

    pub fn metrics(&self) -> Arc<DaemonMetrics> {
        self.metrics.clone()
    }

    pub fn authorized(&self) -> Arc<AuthorizedKeySet> {
        self.authorized.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Announce the daemon and serve requests until shutdown.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let record = serde_json::to_string(&PublicKeyRecord::for_keypair(&self.keypair)?)?;
        self.substrate
            .register_principal(&self.config.address, &record)
            .await?;

        if self.config.hidden {
            info!(device = %self.config.device, "device info publication suppressed (--hide)");
        } else {
            self.publish_device_info().await?;
        }
        self.share_username().await?;

        tokio::spawn(heartbeat::heartbeat_task(
            self.config.clone(),
            self.substrate.clone(),
            self.shutdown_tx.subscribe(),
        ));

        let mut requests = self
            .substrate
            .subscribe(
                &self.config.address,
                &daemon_subscription_pattern(&self.config.device),
            )
            .await?;
        info!(
            address = %self.config.address,
            device = %self.config.device,
            "npd serving session requests"
        );

        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                notification = requests.next() => {
                    match notification {
                        Some(n) => self.dispatch(n).await,
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
        info!("npd shutting down");
        Ok(())
    }

    /// Publish (or re-publish, for `--un-hide`) the public device record.
    pub async fn publish_device_info(&self) -> Result<(), DaemonError> {
        let info = heartbeat::device_info(&self.config);
        let key = NotificationKey::device_info(
            &self.config.address,
            &self.config.device,
            &self.config.address,
        );
        self.substrate
            .put(&key, &serde_json::to_string(&info)?, None)
            .await?;
        Ok(())
    }

    /// Share the device-side login name with each manager so the client
    /// can omit `--remote-user-name`.
    async fn share_username(&self) -> Result<(), DaemonError> {
        let username = std::env::var("USER").unwrap_or_else(|_| "root".to_string());
        for manager in &self.config.managers {
            let key = NotificationKey::username(manager, &self.config.device, &self.config.address);
            self.substrate.put(&key, &username, None).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, notification: Notification) {
        let sender = notification.key.from.clone();

        if notification.key.entry == "ping" {
            self.handle_ping(&sender).await;
            return;
        }

        // Authorisation comes before the request value is even parsed.
        if !self.config.is_authorised(&sender) {
            self.metrics.dropped_requests.fetch_add(1, Ordering::Relaxed);
            debug!(sender = %sender, "request from unauthorised sender dropped");
            return;
        }

        let session_id: SessionId = match notification.key.entry.parse() {
            Ok(id) => id,
            Err(_) => {
                warn!(key = %notification.key, "notification with no session id ignored");
                return;
            }
        };

        let request: SessionRequest = match serde_json::from_str(&notification.value) {
            Ok(request) => request,
            Err(e) => {
                warn!(session = %session_id, error = %e, "malformed request");
                self.publish_error(&sender, session_id, format!("malformed request: {e}"))
                    .await;
                return;
            }
        };
        if request.session_id != session_id {
            self.publish_error(
                &sender,
                session_id,
                "request session id does not match its key".to_string(),
            )
            .await;
            return;
        }

        let ctx = SessionContext {
            config: self.config.clone(),
            keypair: self.keypair.clone(),
            authorized: self.authorized.clone(),
            cleanup: Arc::new(CleanupRegistry::new()),
        };
        let substrate = self.substrate.clone();
        let metrics = self.metrics.clone();
        let daemon = self.config.clone();
        tokio::spawn(async move {
            run_session(ctx, substrate, metrics, daemon, sender, request).await;
        });
    }

    async fn handle_ping(&self, sender: &Address) {
        let info = heartbeat::device_info(&self.config);
        let key = NotificationKey::pong(sender, &self.config.device, &self.config.address);
        match serde_json::to_string(&info) {
            Ok(value) => {
                if let Err(e) = self.substrate.notify(&key, &value).await {
                    warn!(error = %e, "pong failed");
                }
            }
            Err(e) => warn!(error = %e, "device info did not serialise"),
        }
    }

    async fn publish_error(&self, client: &Address, session_id: SessionId, message: String) {
        let payload = ResponsePayload {
            session_id,
            status: SessionStatus::Error,
            ephemeral_private_key: None,
            message: Some(message),
        };
        if let Err(e) = publish_response(
            self.substrate.as_ref(),
            &self.keypair,
            &self.config,
            client,
            payload,
        )
        .await
        {
            warn!(session = %session_id, error = %e, "error response publish failed");
        }
    }
}

/// Drive one session to completion: prepare, respond, run the data plane,
/// clean up. Cleanups run on the success, failure, and abort paths alike.
async fn run_session(
    ctx: SessionContext,
    substrate: Arc<dyn Substrate>,
    metrics: Arc<DaemonMetrics>,
    config: Arc<DaemonConfig>,
    client: Address,
    request: SessionRequest,
) {
    let session_id = request.session_id;
    let cleanup = ctx.cleanup.clone();

    match handlers::prepare(&ctx, &request).await {
        Ok(prepared) => {
            if let Err(e) = publish_response(
                substrate.as_ref(),
                &ctx.keypair,
                &config,
                &client,
                prepared.response,
            )
            .await
            {
                warn!(session = %session_id, error = %e, "response publish failed");
                cleanup.run().await;
                return;
            }
            metrics.sessions_started.fetch_add(1, Ordering::Relaxed);

            match prepared.data_plane {
                DataPlane::Splice { rendezvous, sshd } => {
                    match bridge::splice(
                        &session_id.to_string(),
                        rendezvous,
                        sshd,
                        &BridgeConfig::default(),
                    )
                    .await
                    {
                        Ok((inbound, outbound)) => {
                            info!(session = %session_id, inbound, outbound, "session finished")
                        }
                        Err(e) => warn!(session = %session_id, error = %e, "session bridge aborted"),
                    }
                }
                DataPlane::Child(mut child) => match child.wait().await {
                    Ok(status) => info!(session = %session_id, %status, "reverse ssh exited"),
                    Err(e) => warn!(session = %session_id, error = %e, "reverse ssh failed"),
                },
            }
        }
        Err(e) => {
            metrics.sessions_failed.fetch_add(1, Ordering::Relaxed);
            warn!(session = %session_id, error = %e, "session failed");
            let payload = ResponsePayload {
                session_id,
                status: SessionStatus::Error,
                ephemeral_private_key: None,
                message: Some(e.to_string()),
            };
            if let Err(e) =
                publish_response(substrate.as_ref(), &ctx.keypair, &config, &client, payload).await
            {
                warn!(session = %session_id, error = %e, "error response publish failed");
            }
        }
    }

    cleanup.run().await;
}

async fn publish_response(
    substrate: &dyn Substrate,
    keypair: &SigningKeypair,
    config: &DaemonConfig,
    client: &Address,
    payload: ResponsePayload,
) -> Result<(), DaemonError> {
    let session_id = payload.session_id;
    let envelope = SignedEnvelope::sign(payload, HashingAlgo::Sha256, keypair)?;
    let key = NotificationKey::response(client, &session_id, &config.device, &config.address);
    substrate.notify(&key, &envelope.to_json()?).await?;
    Ok(())
}
