//! Relay counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters kept for logging and tests. The relay exposes no
/// metrics endpoint; these are process-local.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    pub allocations_created: AtomicU64,
    pub allocations_closed: AtomicU64,
    pub auth_failures: AtomicU64,
    pub sessions_spliced: AtomicU64,
    pub bytes_relayed: AtomicU64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auth_failures(&self) -> u64 {
        self.auth_failures.load(Ordering::Relaxed)
    }

    pub fn active_allocations(&self) -> u64 {
        self.allocations_created
            .load(Ordering::Relaxed)
            .saturating_sub(self.allocations_closed.load(Ordering::Relaxed))
    }
}
