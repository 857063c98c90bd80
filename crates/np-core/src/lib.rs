//! np-core: shared building blocks for the NoPorts session protocol.
//!
//! This crate carries the types every component agrees on (addresses,
//! device names, session ids, wire records), the protocol-wide timeout
//! constants, the per-session cleanup tracker, and the bounded-buffer
//! socket bridge used by the relay, the daemon, and the client.

#![forbid(unsafe_code)]

pub mod address;
pub mod bridge;
pub mod cleanup;
pub mod device;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod timeouts;

pub use address::{Address, AddressError};
pub use cleanup::CleanupRegistry;
pub use device::{DeviceName, DeviceNameError};
pub use session::SessionId;
