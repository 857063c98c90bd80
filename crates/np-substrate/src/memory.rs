//! In-memory substrate.
//!
//! Backs the test harnesses and single-process demos. Notifications fan
//! out to every live subscription whose recipient matches the key's `to`
//! address and whose regex matches the full key string; shared records
//! live in a plain map with optional expiry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::trace;

use np_core::Address;

use crate::keys::NotificationKey;
use crate::{Notification, Subscription, Substrate, SubstrateError};

const SUBSCRIPTION_BUFFER: usize = 64;

struct Record {
    value: String,
    expires_at: Option<Instant>,
}

struct Subscriber {
    recipient: Address,
    pattern: Regex,
    sender: mpsc::Sender<Notification>,
    cancelled: Arc<AtomicBool>,
}

/// Process-local substrate shared by every component in one test or demo.
#[derive(Default)]
pub struct InMemorySubstrate {
    records: DashMap<String, Record>,
    subscribers: DashMap<u64, Subscriber>,
    principals: DashMap<Address, String>,
    next_subscriber: AtomicU64,
}

impl InMemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    fn deliver(&self, key: &NotificationKey, value: &str) {
        let full = key.to_string();
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            let sub = entry.value();
            if sub.cancelled.load(Ordering::SeqCst) {
                dead.push(*entry.key());
                continue;
            }
            if sub.recipient != key.to || !sub.pattern.is_match(&full) {
                continue;
            }
            let notification = Notification {
                key: key.clone(),
                value: value.to_string(),
            };
            if sub.sender.try_send(notification).is_err() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }
}

#[async_trait]
impl Substrate for InMemorySubstrate {
    async fn notify(&self, key: &NotificationKey, value: &str) -> Result<(), SubstrateError> {
        trace!(key = %key, "notify");
        self.deliver(key, value);
        Ok(())
    }

    async fn subscribe(
        &self,
        recipient: &Address,
        pattern: &str,
    ) -> Result<Subscription, SubstrateError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| SubstrateError::BadKey(format!("bad pattern: {e}")))?;
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancelled = Arc::new(AtomicBool::new(false));
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.subscribers.insert(
            id,
            Subscriber {
                recipient: recipient.clone(),
                pattern,
                sender,
                cancelled: cancelled.clone(),
            },
        );
        Ok(Subscription::new(receiver, cancelled))
    }

    async fn put(
        &self,
        key: &NotificationKey,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), SubstrateError> {
        self.records.insert(
            key.to_string(),
            Record {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &NotificationKey) -> Result<Option<String>, SubstrateError> {
        let full = key.to_string();
        if let Some(record) = self.records.get(&full) {
            if record
                .expires_at
                .map(|at| at > Instant::now())
                .unwrap_or(true)
            {
                return Ok(Some(record.value.clone()));
            }
        }
        // Expired records are removed lazily.
        self.records
            .remove_if(&full, |_, r| r.expires_at.is_some_and(|at| at <= Instant::now()));
        Ok(None)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<NotificationKey>, SubstrateError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| SubstrateError::BadKey(format!("bad pattern: {e}")))?;
        let mut keys = Vec::new();
        for entry in self.records.iter() {
            if pattern.is_match(entry.key()) {
                keys.push(entry.key().parse()?);
            }
        }
        Ok(keys)
    }

    async fn register_principal(
        &self,
        address: &Address,
        public_key_record: &str,
    ) -> Result<(), SubstrateError> {
        self.principals
            .insert(address.clone(), public_key_record.to_string());
        Ok(())
    }

    async fn signing_public_key(
        &self,
        address: &Address,
    ) -> Result<Option<String>, SubstrateError> {
        Ok(self.principals.get(address).map(|r| r.clone()))
    }

    async fn is_activated(&self, address: &Address) -> Result<bool, SubstrateError> {
        Ok(self.principals.contains_key(address))
    }
}

/// Named process-shared instances backing `mem://<name>` URLs.
pub fn shared(name: &str) -> Arc<InMemorySubstrate> {
    static REGISTRY: OnceLock<DashMap<String, Arc<InMemorySubstrate>>> = OnceLock::new();
    REGISTRY
        .get_or_init(DashMap::new)
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(InMemorySubstrate::new()))
        .clone()
}
