//! Notification-key grammar.
//!
//! Full keys read `<to>:<entry>.<namespace><from>`, e.g. the request
//! `@daemon:7f3e...01.office.sshnp@alice` is the record named
//! `7f3e...01` in namespace `office.sshnp`, sent by `@alice`, addressed
//! to `@daemon`. Constructors below produce every key shape the protocol
//! uses, so the grammar lives in exactly one place.

use std::fmt;
use std::str::FromStr;

use np_core::{Address, DeviceName, SessionId};

use crate::SubstrateError;

/// Namespace suffix for session-protocol keys under one device.
pub fn sshnp_namespace(device: &DeviceName) -> String {
    format!("{device}.sshnp")
}

/// Namespace suffix for rendezvous keys under one device.
pub fn sshrvd_namespace(device: &DeviceName) -> String {
    format!("{device}.sshrvd")
}

/// A parsed notification / shared-record key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NotificationKey {
    pub to: Address,
    pub entry: String,
    pub namespace: String,
    pub from: Address,
}

impl NotificationKey {
    pub fn new(
        to: Address,
        entry: impl Into<String>,
        namespace: impl Into<String>,
        from: Address,
    ) -> Self {
        Self {
            to,
            entry: entry.into(),
            namespace: namespace.into(),
            from,
        }
    }

    /// Session request, client → daemon.
    pub fn request(
        daemon: &Address,
        session: &SessionId,
        device: &DeviceName,
        client: &Address,
    ) -> Self {
        Self::new(
            daemon.clone(),
            session.to_string(),
            sshnp_namespace(device),
            client.clone(),
        )
    }

    /// Session response, daemon → client.
    pub fn response(
        client: &Address,
        session: &SessionId,
        device: &DeviceName,
        daemon: &Address,
    ) -> Self {
        Self::new(
            client.clone(),
            session.to_string(),
            sshnp_namespace(device),
            daemon.clone(),
        )
    }

    /// Shared username record, daemon → client.
    pub fn username(client: &Address, device: &DeviceName, daemon: &Address) -> Self {
        Self::new(
            client.clone(),
            "username",
            sshnp_namespace(device),
            daemon.clone(),
        )
    }

    /// Public device-info record.
    pub fn device_info(to: &Address, device: &DeviceName, daemon: &Address) -> Self {
        Self::new(
            to.clone(),
            "device_info",
            sshnp_namespace(device),
            daemon.clone(),
        )
    }

    /// Heartbeat notification.
    pub fn heartbeat(to: &Address, device: &DeviceName, daemon: &Address) -> Self {
        Self::new(
            to.clone(),
            "heartbeat",
            sshnp_namespace(device),
            daemon.clone(),
        )
    }

    /// Discovery ping, client → daemon.
    pub fn ping(daemon: &Address, device: &DeviceName, client: &Address) -> Self {
        Self::new(
            daemon.clone(),
            "ping",
            sshnp_namespace(device),
            client.clone(),
        )
    }

    /// Discovery pong, daemon → client.
    pub fn pong(client: &Address, device: &DeviceName, daemon: &Address) -> Self {
        Self::new(
            client.clone(),
            "pong",
            sshnp_namespace(device),
            daemon.clone(),
        )
    }

    /// Rendezvous allocation request, client → relay. Value is the
    /// JSON-encoded allocation request record.
    pub fn rvd_request(relay: &Address, device: &DeviceName, client: &Address) -> Self {
        Self::new(
            relay.clone(),
            device.to_string(),
            "sshrvd".to_string(),
            client.clone(),
        )
    }

    /// Rendezvous allocation reply, relay → client. Value is the literal
    /// `"<ip>,<portA>,<portB>,<nonce>"` string.
    pub fn rvd_reply(
        client: &Address,
        session: &SessionId,
        device: &DeviceName,
        relay: &Address,
    ) -> Self {
        Self::new(
            client.clone(),
            session.to_string(),
            sshrvd_namespace(device),
            relay.clone(),
        )
    }
}

impl fmt::Display for NotificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}.{}{}",
            self.to, self.entry, self.namespace, self.from
        )
    }
}

impl FromStr for NotificationKey {
    type Err = SubstrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || SubstrateError::BadKey(s.to_string());
        let (to, rest) = s.split_once(':').ok_or_else(bad)?;
        let at = rest.rfind('@').ok_or_else(bad)?;
        let (body, from) = rest.split_at(at);
        let (entry, namespace) = body.split_once('.').ok_or_else(bad)?;
        Ok(Self {
            to: to.parse().map_err(|_| bad())?,
            entry: entry.to_string(),
            namespace: namespace.to_string(),
            from: from.parse().map_err(|_| bad())?,
        })
    }
}

/// Regex matching every request/ping notification a daemon must service.
pub fn daemon_subscription_pattern(device: &DeviceName) -> String {
    format!(r"^.*\.{}\.sshnp@.*$", regex::escape(device.as_str()))
}

/// Regex matching the response for one session.
pub fn response_subscription_pattern(
    session: &SessionId,
    device: &DeviceName,
    daemon: &Address,
) -> String {
    format!(
        r"^.*:{}\.{}\.sshnp{}$",
        regex::escape(&session.to_string()),
        regex::escape(device.as_str()),
        regex::escape(daemon.as_str()),
    )
}

/// Regex matching every allocation request a relay must service.
pub fn relay_subscription_pattern() -> String {
    r"^.*\.sshrvd@.*$".to_string()
}

/// Regex matching the allocation reply for one session.
pub fn rvd_reply_subscription_pattern(
    session: &SessionId,
    device: &DeviceName,
    relay: &Address,
) -> String {
    format!(
        r"^.*:{}\.{}\.sshrvd{}$",
        regex::escape(&session.to_string()),
        regex::escape(device.as_str()),
        regex::escape(relay.as_str()),
    )
}

/// Regex matching heartbeat and pong notifications from one daemon address.
pub fn discovery_subscription_pattern(daemon: &Address) -> String {
    format!(
        r"^.*:(heartbeat|pong)\..*\.sshnp{}$",
        regex::escape(daemon.as_str())
    )
}

/// Regex matching the public device-info records of one daemon address.
pub fn device_info_scan_pattern(daemon: &Address) -> String {
    format!(
        r"^.*:device_info\..*\.sshnp{}$",
        regex::escape(daemon.as_str())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures() -> (Address, Address, DeviceName, SessionId) {
        (
            "@alice".parse().unwrap(),
            "@bob".parse().unwrap(),
            "office".parse().unwrap(),
            SessionId::new(),
        )
    }

    #[test]
    fn request_key_formats_per_the_wire_grammar() {
        let (client, daemon, device, session) = fixtures();
        let key = NotificationKey::request(&daemon, &session, &device, &client);
        assert_eq!(key.to_string(), format!("@bob:{session}.office.sshnp@alice"));
    }

    #[test]
    fn display_parse_round_trip() {
        let (client, daemon, device, session) = fixtures();
        for key in [
            NotificationKey::request(&daemon, &session, &device, &client),
            NotificationKey::response(&client, &session, &device, &daemon),
            NotificationKey::username(&client, &device, &daemon),
            NotificationKey::device_info(&client, &device, &daemon),
            NotificationKey::heartbeat(&client, &device, &daemon),
            NotificationKey::rvd_request(&daemon, &device, &client),
            NotificationKey::rvd_reply(&client, &session, &device, &daemon),
        ] {
            let parsed: NotificationKey = key.to_string().parse().unwrap();
            assert_eq!(parsed, key);
        }
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for bad in ["no-colon", "@a:noat.ns", "@a:@b", ":x.y@z"] {
            assert!(bad.parse::<NotificationKey>().is_err(), "{bad}");
        }
    }

    #[test]
    fn daemon_pattern_matches_requests_and_pings_only_for_its_device() {
        let (client, daemon, device, session) = fixtures();
        let pattern = regex::Regex::new(&daemon_subscription_pattern(&device)).unwrap();
        let request = NotificationKey::request(&daemon, &session, &device, &client).to_string();
        let ping = NotificationKey::ping(&daemon, &device, &client).to_string();
        assert!(pattern.is_match(&request));
        assert!(pattern.is_match(&ping));

        let other_device: DeviceName = "garage".parse().unwrap();
        let other = NotificationKey::request(&daemon, &session, &other_device, &client).to_string();
        assert!(!pattern.is_match(&other));
    }

    #[test]
    fn response_pattern_is_session_scoped() {
        let (client, daemon, device, session) = fixtures();
        let pattern =
            regex::Regex::new(&response_subscription_pattern(&session, &device, &daemon)).unwrap();
        let response = NotificationKey::response(&client, &session, &device, &daemon).to_string();
        assert!(pattern.is_match(&response));

        let other = NotificationKey::response(&client, &SessionId::new(), &device, &daemon);
        assert!(!pattern.is_match(&other.to_string()));
    }
}
