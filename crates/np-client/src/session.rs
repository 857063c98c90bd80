//! Session orchestration.
//!
//! One [`SessionOrchestrator::run`] call is one session attempt: confirm
//! the daemon, obtain a rendezvous allocation when the host is an `@rvd`
//! address, publish the request, validate the signed response, and stand
//! up the local tunnel endpoint. The client never dials the rendezvous
//! before the daemon's response arrives.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use np_core::protocol::{
    AuthPayload, DeviceInfo, ResponsePayload, RvdAllocation, RvdRequest, SessionMode,
    SessionRequest, SessionStatus,
};
use np_core::{timeouts, Address, CleanupRegistry, SessionId};
use np_crypto::{
    generate_nonce, EphemeralSshKeypair, HashingAlgo, SignedEnvelope, SigningKeypair,
};
use np_substrate::directory::DirectoryError;
use np_substrate::keys::{response_subscription_pattern, rvd_reply_subscription_pattern};
use np_substrate::{
    KeyDirectory, Notification, NotificationKey, Substrate, SubstrateError, Subscription,
};

use crate::config::ClientConfig;
use crate::tunnel;
use crate::ExitCode;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("daemon address {0} is not activated on the substrate")]
    DaemonNotActivated(Address),
    #[error("invalid rendezvous address in --host: {0}")]
    BadRendezvousAddress(np_core::AddressError),
    #[error("legacy reverse mode needs a public IP in --host, not {0}")]
    ReverseNeedsHost(String),
    #[error("reverse mode needs --remote-user-name or a shared username record")]
    MissingUsername,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("subscription closed while waiting for {0}")]
    SubscriptionClosed(&'static str),
    #[error("daemon error: {0}")]
    Remote(String),
    #[error("daemon replied with a status this client does not support")]
    UnsupportedStatus,
    #[error("response envelope failed verification")]
    ResponseVerification,
    #[error("response carried no ephemeral private key")]
    MissingEphemeralKey,
    #[error("malformed rendezvous reply: {0}")]
    BadAllocation(#[from] np_core::protocol::AllocationParseError),
    #[error(transparent)]
    Substrate(#[from] SubstrateError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Key(#[from] np_crypto::KeyError),
    #[error(transparent)]
    Envelope(#[from] np_crypto::EnvelopeError),
    #[error(transparent)]
    SshKey(#[from] np_crypto::SshKeyError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialisation: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Timeout(_) => ExitCode::Timeout,
            Self::Remote(_) | Self::UnsupportedStatus => ExitCode::Remote,
            _ => ExitCode::Usage,
        }
    }
}

/// An established session as handed back to `main`.
#[derive(Debug)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub local_port: u16,
    pub username: Option<String>,
    pub identity_file: Option<PathBuf>,
    /// The command emitted on stdout for the user (or exec mode) to run.
    pub ssh_command: String,
    /// Running local tunnel, when this client serves one (direct mode).
    pub tunnel: Option<tokio::task::JoinHandle<std::io::Result<(u64, u64)>>>,
}

pub struct SessionOrchestrator {
    config: ClientConfig,
    substrate: Arc<dyn Substrate>,
    directory: KeyDirectory,
    keypair: Arc<SigningKeypair>,
    cleanup: Arc<CleanupRegistry>,
}

impl SessionOrchestrator {
    pub fn new(
        config: ClientConfig,
        substrate: Arc<dyn Substrate>,
        keypair: SigningKeypair,
    ) -> Self {
        let directory = KeyDirectory::new(substrate.clone());
        Self {
            config,
            substrate,
            directory,
            keypair: Arc::new(keypair),
            cleanup: Arc::new(CleanupRegistry::new()),
        }
    }

    /// The session's cleanup registry; `main` runs it on every exit path,
    /// including SIGINT.
    pub fn cleanup(&self) -> Arc<CleanupRegistry> {
        self.cleanup.clone()
    }

    pub async fn run(&self) -> Result<SessionOutcome, SessionError> {
        let config = &self.config;

        if !self.substrate.is_activated(&config.daemon_address).await? {
            return Err(SessionError::DaemonNotActivated(
                config.daemon_address.clone(),
            ));
        }

        let session_id = SessionId::new();
        info!(session = %session_id, daemon = %config.daemon_address, device = %config.device, "starting session");

        let mut responses = self
            .substrate
            .subscribe(
                &config.client_address,
                &response_subscription_pattern(&session_id, &config.device, &config.daemon_address),
            )
            .await?;

        let username = self.resolve_username().await?;
        let direct = !config.legacy_daemon && self.daemon_supports_direct().await;

        match (config.rendezvous_address(), direct) {
            (Some(Err(e)), _) => Err(SessionError::BadRendezvousAddress(e)),
            (Some(Ok(_)), false) => Err(SessionError::ReverseNeedsHost(config.host.clone())),
            (Some(Ok(relay)), true) => {
                self.run_direct(session_id, relay, username, &mut responses)
                    .await
            }
            (None, _) => self.run_reverse(session_id, username, &mut responses).await,
        }
    }

    async fn run_direct(
        &self,
        session_id: SessionId,
        relay: Address,
        username: Option<String>,
        responses: &mut Subscription,
    ) -> Result<SessionOutcome, SessionError> {
        let config = &self.config;

        // Allocation first: the relay's reply carries the ports and nonce
        // everything else references.
        let mut replies = self
            .substrate
            .subscribe(
                &config.client_address,
                &rvd_reply_subscription_pattern(&session_id, &config.device, &relay),
            )
            .await?;
        let client_nonce = generate_nonce()?;
        let rvd_request = RvdRequest {
            session_id,
            daemon_address: config.daemon_address.clone(),
            client_nonce: Some(client_nonce.clone()),
        };
        self.substrate
            .notify(
                &NotificationKey::rvd_request(&relay, &config.device, &config.client_address),
                &serde_json::to_string(&rvd_request)?,
            )
            .await?;
        let reply = next_with_timeout(&mut replies, "rendezvous allocation").await?;
        let allocation: RvdAllocation = reply.value.parse()?;
        debug!(session = %session_id, ip = %allocation.ip, port_a = allocation.port_a, port_b = allocation.port_b, "allocation received");

        // The local port is real before the request is published.
        let listener = TcpListener::bind(("127.0.0.1", config.local_port)).await?;
        let local_port = listener.local_addr()?.port();

        let client_keys = if config.send_ssh_public_key {
            Some(EphemeralSshKeypair::generate(
                config.ssh_algo,
                &session_id.to_string(),
            )?)
        } else {
            None
        };

        let request = SessionRequest {
            session_id,
            mode: SessionMode::Direct,
            host: allocation.ip.to_string(),
            port: allocation.port_b,
            ephemeral_public_key: client_keys.as_ref().map(|k| k.public_openssh.clone()),
            remote_forward_port: None,
            remote_username: username.clone(),
            ssh_public_key: None,
            rvd_nonce: Some(allocation.nonce.clone()),
        };
        self.publish_request(session_id, &request).await?;

        // The response confirms the daemon is dialling its side; only now
        // may this client touch portA.
        let response = self.await_response(responses, session_id).await?;

        let mut relay_socket =
            TcpStream::connect((allocation.ip, allocation.port_a)).await?;
        let payload = AuthPayload {
            session_id,
            rvd_nonce: allocation.nonce.clone(),
            client_nonce: Some(client_nonce),
        };
        let envelope = SignedEnvelope::sign(payload, HashingAlgo::Sha256, &self.keypair)?;
        relay_socket
            .write_all(format!("{}\n", envelope.to_json()?).as_bytes())
            .await?;

        let identity_file = match &config.identity_file {
            Some(path) => Some(path.clone()),
            None => {
                let key = match (&client_keys, response.ephemeral_private_key) {
                    (Some(pair), _) => pair.private_openssh.to_string(),
                    (None, Some(key)) => key,
                    (None, None) => return Err(SessionError::MissingEphemeralKey),
                };
                Some(self.write_identity(session_id, &key).await?)
            }
        };

        let tunnel = tokio::spawn(tunnel::serve_one(listener, relay_socket));
        let ssh_command = ssh_command(
            username.as_deref(),
            local_port,
            identity_file.as_deref(),
            &config.local_ssh_options,
        );
        info!(session = %session_id, local_port, "tunnel ready");

        Ok(SessionOutcome {
            session_id,
            local_port,
            username,
            identity_file,
            ssh_command,
            tunnel: Some(tunnel),
        })
    }

    async fn run_reverse(
        &self,
        session_id: SessionId,
        username: Option<String>,
        responses: &mut Subscription,
    ) -> Result<SessionOutcome, SessionError> {
        let config = &self.config;
        let username = match username {
            Some(username) => username,
            // The shared record can lag on slow substrates; poll within
            // the configured window before giving up.
            None => self
                .wait_for_username()
                .await?
                .ok_or(SessionError::MissingUsername)?,
        };

        // Pick the forward port up front; the daemon's `ssh -R` will bind
        // it on this host, so the probe listener must not stay open.
        let local_port = if config.local_port != 0 {
            config.local_port
        } else {
            let probe = TcpListener::bind(("127.0.0.1", 0)).await?;
            let port = probe.local_addr()?.port();
            drop(probe);
            port
        };

        // The daemon authorises this key; the user's ssh presents it
        // through the forwarded port.
        let pair = EphemeralSshKeypair::generate(config.ssh_algo, &session_id.to_string())?;

        let request = SessionRequest {
            session_id,
            mode: SessionMode::Reverse,
            host: config.host.clone(),
            port: config.port,
            ephemeral_public_key: None,
            remote_forward_port: Some(local_port),
            remote_username: Some(username.clone()),
            ssh_public_key: Some(pair.public_openssh.clone()),
            rvd_nonce: None,
        };
        self.publish_request(session_id, &request).await?;

        let response = self.await_response(responses, session_id).await?;
        debug!(session = %session_id, message = ?response.message, "daemon connected back");

        let identity_file = match &config.identity_file {
            Some(path) => Some(path.clone()),
            None => Some(
                self.write_identity(session_id, &pair.private_openssh)
                    .await?,
            ),
        };

        let ssh_command = ssh_command(
            Some(&username),
            local_port,
            identity_file.as_deref(),
            &config.local_ssh_options,
        );

        Ok(SessionOutcome {
            session_id,
            local_port,
            username: Some(username),
            identity_file,
            ssh_command,
            tunnel: None,
        })
    }

    async fn publish_request(
        &self,
        session_id: SessionId,
        request: &SessionRequest,
    ) -> Result<(), SessionError> {
        let config = &self.config;
        let key = NotificationKey::request(
            &config.daemon_address,
            &session_id,
            &config.device,
            &config.client_address,
        );
        self.substrate
            .notify(&key, &serde_json::to_string(request)?)
            .await?;
        Ok(())
    }

    async fn await_response(
        &self,
        responses: &mut Subscription,
        session_id: SessionId,
    ) -> Result<ResponsePayload, SessionError> {
        let notification = next_with_timeout(responses, "daemon response").await?;
        let envelope: SignedEnvelope<ResponsePayload> =
            SignedEnvelope::from_json(&notification.value)
                .map_err(|_| SessionError::ResponseVerification)?;

        let daemon_key = self
            .directory
            .verifying_key(&self.config.daemon_address)
            .await?;
        envelope
            .verify(&daemon_key)
            .map_err(|_| SessionError::ResponseVerification)?;
        if envelope.payload.session_id != session_id {
            return Err(SessionError::ResponseVerification);
        }

        match envelope.payload.status {
            SessionStatus::Connected => Ok(envelope.payload),
            SessionStatus::Error => Err(SessionError::Remote(
                envelope
                    .payload
                    .message
                    .unwrap_or_else(|| "unspecified daemon error".to_string()),
            )),
            SessionStatus::Unsupported => Err(SessionError::UnsupportedStatus),
        }
    }

    async fn resolve_username(&self) -> Result<Option<String>, SessionError> {
        let config = &self.config;
        if config.remote_username.is_some() {
            return Ok(config.remote_username.clone());
        }
        Ok(self.substrate.get(&self.username_key()).await?)
    }

    async fn wait_for_username(&self) -> Result<Option<String>, SessionError> {
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_millis(self.config.response_ttl_ms);
        let key = self.username_key();
        loop {
            if let Some(username) = self.substrate.get(&key).await? {
                return Ok(Some(username));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
    }

    fn username_key(&self) -> NotificationKey {
        NotificationKey::username(
            &self.config.client_address,
            &self.config.device,
            &self.config.daemon_address,
        )
    }

    /// Consult the daemon's advertised features; an absent or unreadable
    /// record is treated as a current daemon.
    async fn daemon_supports_direct(&self) -> bool {
        let config = &self.config;
        let key = NotificationKey::device_info(
            &config.daemon_address,
            &config.device,
            &config.daemon_address,
        );
        match self.substrate.get(&key).await {
            Ok(Some(raw)) => serde_json::from_str::<DeviceInfo>(&raw)
                .map(|info| info.supported_features.iter().any(|f| f == "direct"))
                .unwrap_or(true),
            _ => true,
        }
    }

    async fn write_identity(
        &self,
        session_id: SessionId,
        key: &str,
    ) -> Result<PathBuf, SessionError> {
        let dir = self.config.state_dir.join(session_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{session_id}_sshnp"));
        tokio::fs::write(&path, key).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        let session_dir = dir.clone();
        self.cleanup
            .register("ephemeral-identity", move || async move {
                let _ = tokio::fs::remove_dir_all(&session_dir).await;
            })
            .await;
        Ok(path)
    }
}

async fn next_with_timeout(
    subscription: &mut Subscription,
    what: &'static str,
) -> Result<Notification, SessionError> {
    match tokio::time::timeout(timeouts::CONTROL_RESPONSE, subscription.next()).await {
        Ok(Some(notification)) => Ok(notification),
        Ok(None) => Err(SessionError::SubscriptionClosed(what)),
        Err(_) => Err(SessionError::Timeout(what)),
    }
}

/// Render the command emitted on stdout.
fn ssh_command(
    username: Option<&str>,
    local_port: u16,
    identity: Option<&std::path::Path>,
    options: &[String],
) -> String {
    let mut command = format!("ssh -p {local_port}");
    if let Some(identity) = identity {
        command.push_str(&format!(" -i {}", identity.display()));
    }
    for option in options {
        command.push_str(&format!(" -o {option}"));
    }
    match username {
        Some(username) => command.push_str(&format!(" {username}@localhost")),
        None => command.push_str(" localhost"),
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn ssh_command_includes_port_identity_and_user() {
        let command = ssh_command(
            Some("alice"),
            2222,
            Some(Path::new("/tmp/key")),
            &["ForwardAgent=no".to_string()],
        );
        assert_eq!(
            command,
            "ssh -p 2222 -i /tmp/key -o ForwardAgent=no alice@localhost"
        );
    }

    #[test]
    fn ssh_command_without_a_username_targets_bare_localhost() {
        assert_eq!(ssh_command(None, 2222, None, &[]), "ssh -p 2222 localhost");
    }

    #[test]
    fn error_exit_codes_follow_the_documented_mapping() {
        assert_eq!(
            SessionError::Timeout("daemon response").exit_code(),
            ExitCode::Timeout
        );
        assert_eq!(
            SessionError::Remote("nope".to_string()).exit_code(),
            ExitCode::Remote
        );
        assert_eq!(
            SessionError::MissingUsername.exit_code(),
            ExitCode::Usage
        );
    }
}
