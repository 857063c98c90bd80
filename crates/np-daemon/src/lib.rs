//! np-daemon: the on-device daemon (`npd`).
//!
//! Listens for authorised session requests on the substrate, brokers the
//! chosen data plane (rendezvous dial-out or legacy reverse SSH), manages
//! the in-process authorised-key set, and advertises itself via
//! device-info records and heartbeats. A per-session failure produces an
//! error response envelope; the daemon itself never terminates on one.

#![forbid(unsafe_code)]

pub mod authorized_keys;
pub mod config;
pub mod controller;
pub mod handlers;
pub mod heartbeat;

pub use authorized_keys::AuthorizedKeySet;
pub use config::{ConfigError, DaemonConfig};
pub use controller::{DaemonController, DaemonMetrics};

/// Features advertised in device info and heartbeats; the client picks its
/// session strategy from these.
pub const SUPPORTED_FEATURES: &[&str] = &["direct", "reverse", "ping"];

/// Version of the core protocol package, advertised alongside the build
/// version.
pub const CORE_PACKAGE_VERSION: &str = env!("CARGO_PKG_VERSION");
