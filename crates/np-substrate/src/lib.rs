//! np-substrate: the encrypted pub/sub + key-value substrate interface.
//!
//! The substrate itself (an external identity/messaging service) is out of
//! scope; every component talks to it through the [`Substrate`] trait.
//! Notifications are end-to-end encrypted and recipient-scoped by the
//! substrate; keys follow the `<to>:<entry>.<namespace><from>` grammar.
//!
//! [`memory::InMemorySubstrate`] provides a process-local implementation
//! used by the test harnesses and by single-process demos (`mem://` URLs).

#![forbid(unsafe_code)]

pub mod directory;
pub mod keys;
pub mod memory;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use np_core::Address;

pub use directory::KeyDirectory;
pub use keys::NotificationKey;
pub use memory::InMemorySubstrate;

#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("address not known to the substrate: {0}")]
    UnknownAddress(Address),
    #[error("malformed notification key: {0}")]
    BadKey(String),
    #[error("substrate i/o: {0}")]
    Transient(String),
    #[error("unsupported substrate url: {0}")]
    UnsupportedUrl(String),
}

impl SubstrateError {
    /// Transient errors are the only class worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// One delivered notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub key: NotificationKey,
    pub value: String,
}

/// A live subscription. Dropping or cancelling it releases the
/// substrate-side resources; session cleanup should call [`cancel`].
///
/// [`cancel`]: Subscription::cancel
pub struct Subscription {
    pub receiver: mpsc::Receiver<Notification>,
    cancelled: Arc<AtomicBool>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<Notification>, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            receiver,
            cancelled,
        }
    }

    /// Receive the next matching notification.
    pub async fn next(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    /// Explicitly stop the subscription.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.receiver.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// The substrate as seen by the client, daemon, and relay.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Send an encrypted notification to `key.to`.
    async fn notify(&self, key: &NotificationKey, value: &str) -> Result<(), SubstrateError>;

    /// Stream notifications addressed to `recipient` whose full key
    /// matches `pattern` (a regex). The substrate only ever delivers a
    /// notification to the principal it is addressed to.
    async fn subscribe(
        &self,
        recipient: &Address,
        pattern: &str,
    ) -> Result<Subscription, SubstrateError>;

    /// Store a shared record readable by `key.to`.
    async fn put(
        &self,
        key: &NotificationKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), SubstrateError>;

    /// Fetch a shared record.
    async fn get(&self, key: &NotificationKey) -> Result<Option<String>, SubstrateError>;

    /// List shared record keys matching `pattern` (a regex over full keys).
    async fn scan(&self, pattern: &str) -> Result<Vec<NotificationKey>, SubstrateError>;

    /// Publish this principal's signing public-key record.
    async fn register_principal(
        &self,
        address: &Address,
        public_key_record: &str,
    ) -> Result<(), SubstrateError>;

    /// Fetch a principal's signing public-key record.
    async fn signing_public_key(
        &self,
        address: &Address,
    ) -> Result<Option<String>, SubstrateError>;

    /// Whether the address exists and is activated on the substrate.
    async fn is_activated(&self, address: &Address) -> Result<bool, SubstrateError>;
}

/// Open a substrate from a URL.
///
/// `mem://<name>` returns a process-shared in-memory substrate (one
/// instance per name), which is what the test harnesses and single-process
/// demos use. A real substrate client registers its own scheme here.
pub fn connect(url: &str) -> Result<Arc<dyn Substrate>, SubstrateError> {
    match url.split_once("://") {
        Some(("mem", name)) => Ok(memory::shared(name)),
        _ => Err(SubstrateError::UnsupportedUrl(url.to_string())),
    }
}
