//! Rendezvous socket authentication.
//!
//! The first line on every accepted socket must be a signed auth envelope.
//! Nonce and session id are checked before the signature; any failure
//! closes the socket and tears the allocation down.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use thiserror::Error;

use np_core::protocol::AuthPayload;
use np_crypto::{SignedEnvelope, VerifyingKey};

use crate::allocation::{Allocation, Side};

/// Upper bound on the auth line; anything longer is not a valid envelope.
pub const MAX_AUTH_LINE: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("i/o while reading auth envelope: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed auth envelope: {0}")]
    Malformed(String),
    #[error("rvd nonce does not match this allocation")]
    NonceMismatch,
    #[error("session id does not match this allocation")]
    SessionMismatch,
    #[error("auth envelope signature verification failed")]
    BadSignature,
}

/// Run the auth handshake on a freshly accepted socket.
///
/// On success the stream is returned still wrapped in its read buffer, so
/// any bytes the peer pipelined after the auth line are preserved for the
/// splice.
pub async fn authenticate_socket<S>(
    stream: S,
    side: Side,
    allocation: &Allocation,
    expected_key: &VerifyingKey,
) -> Result<BufReader<S>, AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    {
        // Bound the first read so a peer cannot grow the line without limit.
        let mut limited = (&mut reader).take(MAX_AUTH_LINE);
        limited.read_line(&mut line).await?;
    }

    let envelope: SignedEnvelope<AuthPayload> =
        SignedEnvelope::from_json(line.trim_end()).map_err(|e| AuthError::Malformed(e.to_string()))?;

    if envelope.payload.rvd_nonce != allocation.nonce {
        return Err(AuthError::NonceMismatch);
    }
    if envelope.payload.session_id != allocation.session_id {
        return Err(AuthError::SessionMismatch);
    }
    envelope
        .verify(expected_key)
        .map_err(|_| AuthError::BadSignature)?;

    allocation.note_authed(side);
    Ok(reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    use np_core::{Address, SessionId};
    use np_crypto::{HashingAlgo, SigningAlgo, SigningKeypair};

    use crate::allocation::AllocationManager;
    use crate::metrics::RelayMetrics;

    fn allocation(nonce: &str) -> (Arc<Allocation>, SessionId) {
        let mgr = AllocationManager::new(Arc::new(RelayMetrics::new()));
        let client: Address = "@alice".parse().unwrap();
        let daemon: Address = "@bob".parse().unwrap();
        let session = SessionId::new();
        let alloc = mgr
            .create(session, client, daemon, nonce.to_string())
            .unwrap();
        (alloc, session)
    }

    fn signed_line(
        keypair: &SigningKeypair,
        session: SessionId,
        nonce: &str,
    ) -> String {
        let payload = AuthPayload {
            session_id: session,
            rvd_nonce: nonce.to_string(),
            client_nonce: None,
        };
        let envelope = SignedEnvelope::sign(payload, HashingAlgo::Sha256, keypair).unwrap();
        format!("{}\n", envelope.to_json().unwrap())
    }

    #[tokio::test]
    async fn accepts_a_valid_envelope_and_preserves_pipelined_bytes() {
        let keypair = SigningKeypair::generate(SigningAlgo::Ed25519).unwrap();
        let (alloc, session) = allocation("the-nonce");
        let (near, mut far) = tokio::io::duplex(4096);

        let line = signed_line(&keypair, session, "the-nonce");
        far.write_all(line.as_bytes()).await.unwrap();
        far.write_all(b"SSH-2.0-client").await.unwrap();

        let mut stream =
            authenticate_socket(near, Side::Client, &alloc, &keypair.verifying_key())
                .await
                .unwrap();
        assert_eq!(
            alloc.state(),
            crate::allocation::AllocationState::OneSideAuthed
        );

        let mut pipelined = [0u8; 14];
        stream.read_exact(&mut pipelined).await.unwrap();
        assert_eq!(&pipelined, b"SSH-2.0-client");
    }

    #[tokio::test]
    async fn rejects_wrong_nonce_before_checking_the_signature() {
        let keypair = SigningKeypair::generate(SigningAlgo::Ed25519).unwrap();
        let (alloc, session) = allocation("expected");
        let (near, mut far) = tokio::io::duplex(4096);

        let line = signed_line(&keypair, session, "something-else");
        far.write_all(line.as_bytes()).await.unwrap();

        let result =
            authenticate_socket(near, Side::Client, &alloc, &keypair.verifying_key()).await;
        assert!(matches!(result, Err(AuthError::NonceMismatch)));
    }

    #[tokio::test]
    async fn rejects_a_signature_from_the_wrong_key() {
        let keypair = SigningKeypair::generate(SigningAlgo::Ed25519).unwrap();
        let imposter = SigningKeypair::generate(SigningAlgo::Ed25519).unwrap();
        let (alloc, session) = allocation("the-nonce");
        let (near, mut far) = tokio::io::duplex(4096);

        let line = signed_line(&imposter, session, "the-nonce");
        far.write_all(line.as_bytes()).await.unwrap();

        let result =
            authenticate_socket(near, Side::Client, &alloc, &keypair.verifying_key()).await;
        assert!(matches!(result, Err(AuthError::BadSignature)));
    }

    #[tokio::test]
    async fn rejects_a_tampered_session_id() {
        let keypair = SigningKeypair::generate(SigningAlgo::Ed25519).unwrap();
        let (alloc, _session) = allocation("the-nonce");
        let (near, mut far) = tokio::io::duplex(4096);

        // Signed for a different session than the allocation's.
        let line = signed_line(&keypair, SessionId::new(), "the-nonce");
        far.write_all(line.as_bytes()).await.unwrap();

        let result =
            authenticate_socket(near, Side::Client, &alloc, &keypair.verifying_key()).await;
        assert!(matches!(result, Err(AuthError::SessionMismatch)));
    }
}
