//! Wire records exchanged over the substrate and on rendezvous sockets.
//!
//! Everything here is plain JSON. Unknown fields are ignored on parse so
//! that newer peers can add fields without breaking older ones; unknown
//! `status` discriminants map to [`SessionStatus::Unsupported`].

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::Address;
use crate::session::SessionId;

/// How the SSH bytes will reach the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Both parties dial a rendezvous relay.
    Direct,
    /// Legacy path: the daemon dials back to the client host over SSH.
    Reverse,
}

/// Request record, client → daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub session_id: SessionId,
    pub mode: SessionMode,
    /// Rendezvous IP (direct) or the client host to dial back to (reverse).
    pub host: String,
    /// Daemon-facing rendezvous port (direct) or client SSH port (reverse).
    pub port: u16,
    /// Client-generated ephemeral public key, when the client manages keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_public_key: Option<String>,
    /// Reverse mode: port on the client host to remote-forward.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_forward_port: Option<u16>,
    /// Reverse mode: username on the client host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_username: Option<String>,
    /// Reverse mode: client SSH public key to authorise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
    /// Direct mode: nonce issued by the rendezvous for this allocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rvd_nonce: Option<String>,
}

/// Status discriminant of a daemon response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connected,
    Error,
    /// Any discriminant this build does not know.
    #[serde(other)]
    Unsupported,
}

/// Signed response payload, daemon → client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub session_id: SessionId,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Signed payload sent as the first line on each rendezvous socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub session_id: SessionId,
    pub rvd_nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_nonce: Option<String>,
}

/// Allocation request, client → rendezvous. Carried as the notification
/// value; the client address is the notification sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RvdRequest {
    pub session_id: SessionId,
    pub daemon_address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_nonce: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocationParseError {
    #[error("expected \"<ip>,<portA>,<portB>,<nonce>\", got {0} fields")]
    FieldCount(usize),
    #[error("invalid ip address")]
    BadIp,
    #[error("invalid port")]
    BadPort,
}

/// Rendezvous allocation reply, wire form `"<ip>,<portA>,<portB>,<nonce>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RvdAllocation {
    pub ip: IpAddr,
    pub port_a: u16,
    pub port_b: u16,
    pub nonce: String,
}

impl fmt::Display for RvdAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.ip, self.port_a, self.port_b, self.nonce)
    }
}

impl FromStr for RvdAllocation {
    type Err = AllocationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.trim().split(',').collect();
        if fields.len() != 4 {
            return Err(AllocationParseError::FieldCount(fields.len()));
        }
        Ok(Self {
            ip: fields[0].parse().map_err(|_| AllocationParseError::BadIp)?,
            port_a: fields[1]
                .parse()
                .map_err(|_| AllocationParseError::BadPort)?,
            port_b: fields[2]
                .parse()
                .map_err(|_| AllocationParseError::BadPort)?,
            nonce: fields[3].to_string(),
        })
    }
}

/// Device information the daemon shares and carries in heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub devicename: String,
    pub version: String,
    pub core_package_version: String,
    pub supported_features: Vec<String>,
}
