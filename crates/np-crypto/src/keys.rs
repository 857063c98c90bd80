//! Long-term signing keys and algorithm identifiers.
//!
//! Two signing algorithms are supported on the wire: Ed25519 (raw 32-byte
//! public keys, base64) and RSA-2048 (SPKI DER public keys, base64, PKCS#1
//! v1.5 signatures). Both sign the digest of the canonical payload bytes.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::Signer as _;
use ed25519_dalek::Verifier as _;
use rand_core::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use zeroize::Zeroizing;

pub const RSA_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid key bytes")]
    InvalidKeyBytes,
    #[error("invalid signature bytes")]
    InvalidSignatureBytes,
    #[error("signature verification failed")]
    BadSignature,
    #[error("signing algorithm mismatch: key is {key}, envelope says {envelope}")]
    AlgorithmMismatch {
        key: SigningAlgo,
        envelope: SigningAlgo,
    },
    #[error("rng failure")]
    Rng,
    #[error("rsa error: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("pkcs8 error: {0}")]
    Pkcs8(#[from] rsa::pkcs8::Error),
    #[error("spki error: {0}")]
    Spki(#[from] rsa::pkcs8::spki::Error),
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("keyfile error: {0}")]
    Io(#[from] std::io::Error),
    #[error("keyfile format error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Signature algorithm carried in every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningAlgo {
    #[serde(rename = "ed25519")]
    Ed25519,
    #[serde(rename = "rsa2048")]
    Rsa2048,
}

impl fmt::Display for SigningAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigningAlgo::Ed25519 => f.write_str("ed25519"),
            SigningAlgo::Rsa2048 => f.write_str("rsa2048"),
        }
    }
}

impl FromStr for SigningAlgo {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ed25519" => Ok(Self::Ed25519),
            "rsa2048" => Ok(Self::Rsa2048),
            other => Err(format!("unsupported signing algorithm: {other}")),
        }
    }
}

/// Digest algorithm carried in every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashingAlgo {
    #[serde(rename = "sha256")]
    Sha256,
    #[serde(rename = "sha512")]
    Sha512,
}

impl HashingAlgo {
    pub fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        match self {
            HashingAlgo::Sha256 => Sha256::digest(bytes).to_vec(),
            HashingAlgo::Sha512 => Sha512::digest(bytes).to_vec(),
        }
    }
}

impl fmt::Display for HashingAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashingAlgo::Sha256 => f.write_str("sha256"),
            HashingAlgo::Sha512 => f.write_str("sha512"),
        }
    }
}

/// A principal's long-term signing keypair.
pub enum SigningKeypair {
    Ed25519(ed25519_dalek::SigningKey),
    Rsa(RsaPrivateKey),
}

impl SigningKeypair {
    pub fn generate(algo: SigningAlgo) -> Result<Self, KeyError> {
        match algo {
            SigningAlgo::Ed25519 => Ok(Self::Ed25519(ed25519_dalek::SigningKey::generate(
                &mut OsRng,
            ))),
            SigningAlgo::Rsa2048 => Ok(Self::Rsa(RsaPrivateKey::new(&mut OsRng, RSA_BITS)?)),
        }
    }

    pub fn algo(&self) -> SigningAlgo {
        match self {
            Self::Ed25519(_) => SigningAlgo::Ed25519,
            Self::Rsa(_) => SigningAlgo::Rsa2048,
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        match self {
            Self::Ed25519(key) => VerifyingKey::Ed25519(key.verifying_key()),
            Self::Rsa(key) => VerifyingKey::Rsa(key.to_public_key()),
        }
    }

    /// Sign the digest of a canonical payload.
    pub fn sign_digest(&self, hashing: HashingAlgo, digest: &[u8]) -> Result<Vec<u8>, KeyError> {
        match self {
            Self::Ed25519(key) => Ok(key.sign(digest).to_bytes().to_vec()),
            Self::Rsa(key) => Ok(key.sign(pkcs1v15_padding(hashing), digest)?),
        }
    }

    /// Load a keypair from the JSON keyfile format written by [`save`](Self::save).
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let raw = Zeroizing::new(std::fs::read_to_string(path)?);
        let file: Keyfile = serde_json::from_str(&raw)?;
        let bytes = Zeroizing::new(BASE64.decode(file.private_key.as_bytes())?);
        match file.signing_algo {
            SigningAlgo::Ed25519 => {
                let seed: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| KeyError::InvalidKeyBytes)?;
                Ok(Self::Ed25519(ed25519_dalek::SigningKey::from_bytes(&seed)))
            }
            SigningAlgo::Rsa2048 => Ok(Self::Rsa(RsaPrivateKey::from_pkcs8_der(&bytes)?)),
        }
    }

    /// Persist the keypair to `path` as JSON.
    pub fn save(&self, path: &Path) -> Result<(), KeyError> {
        let private = match self {
            Self::Ed25519(key) => Zeroizing::new(key.to_bytes().to_vec()),
            Self::Rsa(key) => Zeroizing::new(key.to_pkcs8_der()?.as_bytes().to_vec()),
        };
        let file = Keyfile {
            signing_algo: self.algo(),
            private_key: BASE64.encode(private.as_slice()),
        };
        std::fs::write(path, serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Keyfile {
    signing_algo: SigningAlgo,
    private_key: String,
}

/// A principal's public verification key.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyingKey {
    Ed25519(ed25519_dalek::VerifyingKey),
    Rsa(RsaPublicKey),
}

impl VerifyingKey {
    pub fn algo(&self) -> SigningAlgo {
        match self {
            Self::Ed25519(_) => SigningAlgo::Ed25519,
            Self::Rsa(_) => SigningAlgo::Rsa2048,
        }
    }

    pub fn to_base64(&self) -> Result<String, KeyError> {
        match self {
            Self::Ed25519(key) => Ok(BASE64.encode(key.to_bytes())),
            Self::Rsa(key) => Ok(BASE64.encode(key.to_public_key_der()?.as_bytes())),
        }
    }

    pub fn from_base64(algo: SigningAlgo, encoded: &str) -> Result<Self, KeyError> {
        let bytes = BASE64.decode(encoded.as_bytes())?;
        match algo {
            SigningAlgo::Ed25519 => {
                let raw: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| KeyError::InvalidKeyBytes)?;
                let key = ed25519_dalek::VerifyingKey::from_bytes(&raw)
                    .map_err(|_| KeyError::InvalidKeyBytes)?;
                Ok(Self::Ed25519(key))
            }
            SigningAlgo::Rsa2048 => Ok(Self::Rsa(RsaPublicKey::from_public_key_der(&bytes)?)),
        }
    }

    /// Verify a signature over a digest, rejecting on any mismatch.
    pub fn verify_digest(
        &self,
        hashing: HashingAlgo,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<(), KeyError> {
        match self {
            Self::Ed25519(key) => {
                let sig = ed25519_dalek::Signature::from_slice(signature)
                    .map_err(|_| KeyError::InvalidSignatureBytes)?;
                key.verify(digest, &sig).map_err(|_| KeyError::BadSignature)
            }
            Self::Rsa(key) => key
                .verify(pkcs1v15_padding(hashing), digest, signature)
                .map_err(|_| KeyError::BadSignature),
        }
    }
}

fn pkcs1v15_padding(hashing: HashingAlgo) -> Pkcs1v15Sign {
    match hashing {
        HashingAlgo::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
        HashingAlgo::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
    }
}

/// The substrate record a principal publishes so peers can verify its
/// envelopes: `{"signingAlgo": "...", "publicKey": "<base64>"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyRecord {
    pub signing_algo: SigningAlgo,
    pub public_key: String,
}

impl PublicKeyRecord {
    pub fn for_keypair(keypair: &SigningKeypair) -> Result<Self, KeyError> {
        let key = keypair.verifying_key();
        Ok(Self {
            signing_algo: key.algo(),
            public_key: key.to_base64()?,
        })
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, KeyError> {
        VerifyingKey::from_base64(self.signing_algo, &self.public_key)
    }
}

/// Fresh random nonce, 16 bytes, base64 (≥128 bits).
pub fn generate_nonce() -> Result<String, KeyError> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes).map_err(|_| KeyError::Rng)?;
    Ok(BASE64.encode(bytes))
}
