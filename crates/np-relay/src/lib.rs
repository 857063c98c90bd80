//! np-relay: neutral TCP rendezvous relay (`rvd`).
//!
//! On request the relay binds a pair of ephemeral TCP listeners, hands the
//! ports plus a fresh nonce back to the client, authenticates the one
//! socket each listener accepts via signed envelope, and then splices the
//! two sockets until either side closes. It never inspects the tunnelled
//! bytes and keeps no state across restarts.

#![forbid(unsafe_code)]

pub mod allocation;
pub mod auth;
pub mod config;
pub mod metrics;
pub mod server;

pub use allocation::{Allocation, AllocationError, AllocationManager, AllocationState, Side};
pub use config::{ConfigError, RelayConfig};
pub use metrics::RelayMetrics;
pub use server::RelayServer;
