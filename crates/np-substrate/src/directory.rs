//! Verification-key directory.
//!
//! Resolves principal addresses to their signing public keys via the
//! substrate's public-key records, caching per address. The relay uses it
//! for both sides of an allocation; the client uses it to verify daemon
//! response envelopes.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use np_core::{retry, Address};
use np_crypto::{PublicKeyRecord, VerifyingKey};

use crate::{Substrate, SubstrateError};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("no public key published for {0}")]
    UnknownPrincipal(Address),
    #[error("malformed public-key record for {address}: {reason}")]
    BadRecord { address: Address, reason: String },
    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

pub struct KeyDirectory {
    substrate: Arc<dyn Substrate>,
    cache: DashMap<Address, VerifyingKey>,
}

impl KeyDirectory {
    pub fn new(substrate: Arc<dyn Substrate>) -> Self {
        Self {
            substrate,
            cache: DashMap::new(),
        }
    }

    /// Resolve `address` to its verification key, consulting the cache
    /// first. Substrate-level transients are retried with backoff; a
    /// missing record is not retried.
    pub async fn verifying_key(&self, address: &Address) -> Result<VerifyingKey, DirectoryError> {
        if let Some(cached) = self.cache.get(address) {
            return Ok(cached.clone());
        }

        let record = retry::with_backoff("signing_public_key", || async {
            self.substrate.signing_public_key(address).await
        })
        .await?
        .ok_or_else(|| DirectoryError::UnknownPrincipal(address.clone()))?;

        let record: PublicKeyRecord =
            serde_json::from_str(&record).map_err(|e| DirectoryError::BadRecord {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        let key = record
            .verifying_key()
            .map_err(|e| DirectoryError::BadRecord {
                address: address.clone(),
                reason: e.to_string(),
            })?;

        self.cache.insert(address.clone(), key.clone());
        Ok(key)
    }
}
