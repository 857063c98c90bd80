//! np-crypto: signed-envelope authentication and key material.
//!
//! Control messages are carried in signed JSON envelopes; the signature
//! covers a canonical serialisation of the payload so that any re-encoding
//! by the substrate cannot invalidate it. Long-term signing keys are
//! Ed25519 or RSA-2048; per-session SSH keys are generated here and
//! destroyed by session cleanup.

#![forbid(unsafe_code)]

pub mod canonical;
pub mod envelope;
pub mod ephemeral;
pub mod keys;

pub use envelope::{EnvelopeError, SignedEnvelope};
pub use ephemeral::{EphemeralSshKeypair, SshKeyAlgo, SshKeyError, SUPPORTED_KEY_PREFIXES};
pub use keys::{
    generate_nonce, HashingAlgo, KeyError, PublicKeyRecord, SigningAlgo, SigningKeypair,
    VerifyingKey,
};
