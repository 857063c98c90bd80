//! Per-session request handlers.
//!
//! The direct handler dials the rendezvous, authenticates with a signed
//! envelope, and bridges the socket to the local sshd; the legacy reverse
//! handler authorises the client's key and opens an outbound `ssh` with a
//! remote forward. Both hand back the response payload to publish plus
//! whatever data plane must keep running afterwards.

use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use np_core::protocol::{
    AuthPayload, ResponsePayload, SessionMode, SessionRequest, SessionStatus,
};
use np_core::{timeouts, CleanupRegistry, SessionId};
use np_crypto::{
    ephemeral, EphemeralSshKeypair, HashingAlgo, SignedEnvelope, SigningKeypair, SshKeyAlgo,
};

use crate::authorized_keys::AuthorizedKeySet;
use crate::config::DaemonConfig;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot reach local sshd on port {port}: {source}")]
    SshdUnreachable {
        port: u16,
        source: std::io::Error,
    },
    #[error("rendezvous dial to {target} failed: {source}")]
    RendezvousDial {
        target: String,
        source: std::io::Error,
    },
    #[error("rendezvous dial to {target} timed out")]
    RendezvousTimeout { target: String },
    #[error("writing rendezvous auth envelope failed: {0}")]
    RendezvousWrite(std::io::Error),
    #[error("request is missing {0}")]
    MissingField(&'static str),
    #[error("this daemon does not accept client ssh public keys")]
    ClientKeysNotAccepted,
    #[error(transparent)]
    SshKey(#[from] np_crypto::SshKeyError),
    #[error(transparent)]
    Envelope(#[from] np_crypto::EnvelopeError),
    #[error("spawning ssh subprocess failed: {0}")]
    Spawn(std::io::Error),
}

/// What keeps running after the response envelope has been published.
pub enum DataPlane {
    /// Bridge the authenticated rendezvous socket to the local sshd.
    Splice {
        rendezvous: TcpStream,
        sshd: TcpStream,
    },
    /// Outbound reverse-SSH subprocess; the session lives as long as it does.
    Child(Child),
}

pub struct PreparedSession {
    pub response: ResponsePayload,
    pub data_plane: DataPlane,
}

pub struct SessionContext {
    pub config: Arc<DaemonConfig>,
    pub keypair: Arc<SigningKeypair>,
    pub authorized: Arc<AuthorizedKeySet>,
    pub cleanup: Arc<CleanupRegistry>,
}

/// Run the mode-appropriate handler. The caller publishes the returned
/// response and then drives the data plane; cleanup steps registered here
/// run on every exit path.
pub async fn prepare(
    ctx: &SessionContext,
    request: &SessionRequest,
) -> Result<PreparedSession, SessionError> {
    match request.mode {
        SessionMode::Direct => prepare_direct(ctx, request).await,
        SessionMode::Reverse => prepare_reverse(ctx, request).await,
    }
}

async fn prepare_direct(
    ctx: &SessionContext,
    request: &SessionRequest,
) -> Result<PreparedSession, SessionError> {
    let session_id = request.session_id;
    let rvd_nonce = request
        .rvd_nonce
        .clone()
        .ok_or(SessionError::MissingField("rvdNonce"))?;

    // The connect doubles as the reachability probe for the local sshd.
    let sshd = TcpStream::connect(("127.0.0.1", ctx.config.sshd_port))
        .await
        .map_err(|source| SessionError::SshdUnreachable {
            port: ctx.config.sshd_port,
            source,
        })?;

    // Ephemeral key for this session: client-managed when the request
    // carries a public key, daemon-managed otherwise (the private half
    // rides back inside the encrypted response notification).
    let (public_key, private_key) = match &request.ephemeral_public_key {
        Some(public) => {
            ephemeral::validate_public_key(public)?;
            (public.clone(), None)
        }
        None => {
            let pair = EphemeralSshKeypair::generate(SshKeyAlgo::Ed25519, &session_id.to_string())?;
            (
                pair.public_openssh.clone(),
                Some(pair.private_openssh.to_string()),
            )
        }
    };

    ctx.authorized
        .authorize(session_id, &public_key, ctx.config.sshd_port)
        .await;
    register_entry_cleanup(ctx, session_id).await;

    // Dial the daemon-facing rendezvous port and present the signed auth
    // envelope. The response is only published once this attempt is in
    // flight, so the client's dial finds the relay ready.
    let target = format!("{}:{}", request.host, request.port);
    let mut rendezvous = tokio::time::timeout(
        timeouts::CONTROL_RESPONSE,
        TcpStream::connect((request.host.as_str(), request.port)),
    )
    .await
    .map_err(|_| SessionError::RendezvousTimeout {
        target: target.clone(),
    })?
    .map_err(|source| SessionError::RendezvousDial {
        target: target.clone(),
        source,
    })?;

    let payload = AuthPayload {
        session_id,
        rvd_nonce,
        client_nonce: None,
    };
    let envelope = SignedEnvelope::sign(payload, HashingAlgo::Sha256, &ctx.keypair)?;
    let line = format!("{}\n", envelope.to_json()?);
    rendezvous
        .write_all(line.as_bytes())
        .await
        .map_err(SessionError::RendezvousWrite)?;
    debug!(session = %session_id, %target, "rendezvous dial authenticated");

    Ok(PreparedSession {
        response: ResponsePayload {
            session_id,
            status: SessionStatus::Connected,
            ephemeral_private_key: private_key,
            message: None,
        },
        data_plane: DataPlane::Splice { rendezvous, sshd },
    })
}

async fn prepare_reverse(
    ctx: &SessionContext,
    request: &SessionRequest,
) -> Result<PreparedSession, SessionError> {
    let session_id = request.session_id;

    if !ctx.config.accept_client_keys {
        return Err(SessionError::ClientKeysNotAccepted);
    }
    let client_key = request
        .ssh_public_key
        .as_deref()
        .ok_or(SessionError::MissingField("sshPublicKey"))?;
    ephemeral::validate_public_key(client_key)?;

    let remote_forward_port = request
        .remote_forward_port
        .ok_or(SessionError::MissingField("remoteForwardPort"))?;
    let username = request
        .remote_username
        .as_deref()
        .ok_or(SessionError::MissingField("remoteUsername"))?;

    ctx.authorized
        .authorize(session_id, client_key, ctx.config.sshd_port)
        .await;
    register_entry_cleanup(ctx, session_id).await;

    // The legacy data plane is an outbound OpenSSH with a remote forward
    // of the local sshd. The child is killed if the session is dropped.
    let child = Command::new("ssh")
        .arg("-o")
        .arg("StrictHostKeyChecking=accept-new")
        .arg("-o")
        .arg("ExitOnForwardFailure=yes")
        .arg("-N")
        .arg("-R")
        .arg(format!(
            "{remote_forward_port}:localhost:{}",
            ctx.config.sshd_port
        ))
        .arg("-p")
        .arg(request.port.to_string())
        .arg(format!("{username}@{}", request.host))
        .kill_on_drop(true)
        .spawn()
        .map_err(SessionError::Spawn)?;
    info!(session = %session_id, host = %request.host, remote_forward_port, "reverse ssh started");

    Ok(PreparedSession {
        response: ResponsePayload {
            session_id,
            status: SessionStatus::Connected,
            ephemeral_private_key: None,
            message: Some("connected".to_string()),
        },
        data_plane: DataPlane::Child(child),
    })
}

async fn register_entry_cleanup(ctx: &SessionContext, session_id: SessionId) {
    let authorized = ctx.authorized.clone();
    ctx.cleanup
        .register("authorized-key-entry", move || async move {
            authorized.remove(&session_id).await;
        })
        .await;
}
