//! Protocol-wide timeout constants.
//!
//! Every suspension point in the protocol carries one of these bounds;
//! none of them are negotiable on the wire.

use std::time::Duration;

/// Wait for a control response (daemon response envelope, rvd allocation reply).
pub const CONTROL_RESPONSE: Duration = Duration::from_secs(10);

/// Window for both sides to authenticate on a rendezvous allocation.
pub const RENDEZVOUS_AUTH: Duration = Duration::from_secs(30);

/// Wait for ping responses during device discovery.
pub const DEVICE_PING: Duration = Duration::from_secs(5);

/// Upper bound on any single cleanup step.
pub const CLEANUP_STEP: Duration = Duration::from_secs(2);

/// Interval between daemon heartbeat publications.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
