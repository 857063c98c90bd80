//! Signed JSON envelopes for control messages.
//!
//! Wire form:
//!
//! ```json
//! { "signature": "<base64>", "hashingAlgo": "sha256",
//!   "signingAlgo": "ed25519", "payload": { ... } }
//! ```
//!
//! The signature covers the digest of the payload's canonical
//! serialisation, so re-encoding by any intermediary cannot invalidate it.
//! Verification happens before the payload is acted on, never after.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canonical;
use crate::keys::{HashingAlgo, KeyError, SigningKeypair, VerifyingKey};

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("payload serialisation failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("signature is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("signing algorithm mismatch: expected {expected}, envelope says {actual}")]
    AlgorithmMismatch {
        expected: crate::keys::SigningAlgo,
        actual: crate::keys::SigningAlgo,
    },
    #[error("signature verification failed")]
    BadSignature,
    #[error(transparent)]
    Key(KeyError),
}

/// A signed container for a control payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedEnvelope<P> {
    pub signature: String,
    pub hashing_algo: HashingAlgo,
    pub signing_algo: crate::keys::SigningAlgo,
    pub payload: P,
}

impl<P: Serialize> SignedEnvelope<P> {
    /// Sign `payload` with the principal's long-term key.
    pub fn sign(
        payload: P,
        hashing: HashingAlgo,
        keypair: &SigningKeypair,
    ) -> Result<Self, EnvelopeError> {
        let canonical = canonical::to_canonical_bytes(&payload)?;
        let digest = hashing.digest(&canonical);
        let signature = keypair
            .sign_digest(hashing, &digest)
            .map_err(EnvelopeError::Key)?;
        Ok(Self {
            signature: BASE64.encode(signature),
            hashing_algo: hashing,
            signing_algo: keypair.algo(),
            payload,
        })
    }

    /// Verify the envelope against the sender's advertised public key.
    ///
    /// Fails if the envelope's declared algorithm does not match the key,
    /// or if the signature does not cover this exact payload.
    pub fn verify(&self, key: &VerifyingKey) -> Result<(), EnvelopeError> {
        if key.algo() != self.signing_algo {
            return Err(EnvelopeError::AlgorithmMismatch {
                expected: key.algo(),
                actual: self.signing_algo,
            });
        }
        let canonical = canonical::to_canonical_bytes(&self.payload)?;
        let digest = self.hashing_algo.digest(&canonical);
        let signature = BASE64.decode(self.signature.as_bytes())?;
        key.verify_digest(self.hashing_algo, &digest, &signature)
            .map_err(|_| EnvelopeError::BadSignature)
    }
}

impl<P: DeserializeOwned> SignedEnvelope<P> {
    /// Parse an envelope from its JSON wire form. Unknown fields are
    /// ignored; unknown algorithm identifiers are rejected.
    pub fn from_json(raw: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(raw)?)
    }
}

impl<P: Serialize> SignedEnvelope<P> {
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }
}
