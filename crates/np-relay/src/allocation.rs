//! Per-session allocation state.
//!
//! Each allocation owns two one-shot TCP listeners and walks
//! `ALLOCATED → ONE_SIDE_AUTHED → BOTH_AUTHED → CLOSED`. The window from
//! creation to `BOTH_AUTHED` is bounded; on expiry the allocation closes
//! and both listeners go away with it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use np_core::{Address, SessionId};

use crate::metrics::RelayMetrics;

/// Which listener a socket arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Daemon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    Allocated,
    OneSideAuthed,
    BothAuthed,
    Closed,
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("session id already has an allocation: {0}")]
    SessionReused(SessionId),
}

pub struct Allocation {
    pub session_id: SessionId,
    pub client_address: Address,
    pub daemon_address: Address,
    pub nonce: String,
    pub created_at: Instant,
    client_authed: AtomicBool,
    daemon_authed: AtomicBool,
    closed: AtomicBool,
}

impl Allocation {
    fn new(
        session_id: SessionId,
        client_address: Address,
        daemon_address: Address,
        nonce: String,
    ) -> Self {
        Self {
            session_id,
            client_address,
            daemon_address,
            nonce,
            created_at: Instant::now(),
            client_authed: AtomicBool::new(false),
            daemon_authed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn expected_address(&self, side: Side) -> &Address {
        match side {
            Side::Client => &self.client_address,
            Side::Daemon => &self.daemon_address,
        }
    }

    pub fn state(&self) -> AllocationState {
        if self.closed.load(Ordering::SeqCst) {
            return AllocationState::Closed;
        }
        match (
            self.client_authed.load(Ordering::SeqCst),
            self.daemon_authed.load(Ordering::SeqCst),
        ) {
            (true, true) => AllocationState::BothAuthed,
            (false, false) => AllocationState::Allocated,
            _ => AllocationState::OneSideAuthed,
        }
    }

    /// Record a successful auth handshake on one side.
    pub fn note_authed(&self, side: Side) -> AllocationState {
        match side {
            Side::Client => self.client_authed.store(true, Ordering::SeqCst),
            Side::Daemon => self.daemon_authed.store(true, Ordering::SeqCst),
        }
        let state = self.state();
        debug!(session = %self.session_id, ?side, ?state, "rendezvous side authenticated");
        state
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// All live allocations, keyed by session id.
pub struct AllocationManager {
    allocations: DashMap<SessionId, Arc<Allocation>>,
    metrics: Arc<RelayMetrics>,
}

impl AllocationManager {
    pub fn new(metrics: Arc<RelayMetrics>) -> Self {
        Self {
            allocations: DashMap::new(),
            metrics,
        }
    }

    /// Create a fresh allocation. A session id is never reused.
    pub fn create(
        &self,
        session_id: SessionId,
        client_address: Address,
        daemon_address: Address,
        nonce: String,
    ) -> Result<Arc<Allocation>, AllocationError> {
        let allocation = Arc::new(Allocation::new(
            session_id,
            client_address,
            daemon_address,
            nonce,
        ));
        match self.allocations.entry(session_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(AllocationError::SessionReused(session_id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(allocation.clone());
                self.metrics
                    .allocations_created
                    .fetch_add(1, Ordering::Relaxed);
                Ok(allocation)
            }
        }
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<Allocation>> {
        self.allocations.get(session_id).map(|a| a.clone())
    }

    /// Terminal transition: drop the allocation and mark it closed.
    pub fn close(&self, session_id: &SessionId) {
        if let Some((_, allocation)) = self.allocations.remove(session_id) {
            allocation.close();
            self.metrics
                .allocations_closed
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> usize {
        self.allocations.len()
    }
}
