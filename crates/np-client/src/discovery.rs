//! Device discovery (`--list-devices`).
//!
//! Gathers the daemon address's device-info records, pings every device,
//! and intersects the responders with heartbeat observations. Devices that
//! answered and are heartbeating are active; the rest are inactive but
//! known.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use np_core::protocol::DeviceInfo;
use np_core::{Address, DeviceName};
use np_substrate::keys::{device_info_scan_pattern, discovery_subscription_pattern};
use np_substrate::{NotificationKey, Substrate, SubstrateError};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

#[derive(Debug, Default)]
pub struct DeviceList {
    pub active: BTreeMap<String, DeviceInfo>,
    pub inactive: BTreeMap<String, DeviceInfo>,
}

/// Collect the daemon's devices, waiting `wait` for ping responses.
pub async fn list_devices(
    substrate: &dyn Substrate,
    client: &Address,
    daemon: &Address,
    wait: Duration,
) -> Result<DeviceList, DiscoveryError> {
    // Known devices come from the public device-info records.
    let mut known: BTreeMap<String, DeviceInfo> = BTreeMap::new();
    for key in substrate.scan(&device_info_scan_pattern(daemon)).await? {
        let Some(device) = device_from_namespace(&key.namespace) else {
            continue;
        };
        if let Some(raw) = substrate.get(&key).await? {
            if let Ok(info) = serde_json::from_str::<DeviceInfo>(&raw) {
                known.insert(device, info);
            }
        }
    }

    // Ping everything, then collect pongs for the wait window.
    let mut observations = substrate
        .subscribe(client, &discovery_subscription_pattern(daemon))
        .await?;
    for device in known.keys() {
        if let Ok(device) = device.parse::<DeviceName>() {
            let key = NotificationKey::ping(daemon, &device, client);
            substrate.notify(&key, "").await?;
        }
    }

    let mut responders = std::collections::BTreeSet::new();
    let deadline = Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, observations.next()).await {
            Ok(Some(notification)) => {
                if let Some(device) = device_from_namespace(&notification.key.namespace) {
                    debug!(device = %device, kind = %notification.key.entry, "discovery observation");
                    responders.insert(device);
                }
            }
            Ok(None) | Err(_) => break,
        }
    }

    // Active means: answered the ping AND currently heartbeating.
    let mut list = DeviceList::default();
    for (device, info) in known {
        let heartbeating = match device.parse::<DeviceName>() {
            Ok(name) => {
                let key = NotificationKey::heartbeat(daemon, &name, daemon);
                substrate.get(&key).await?.is_some()
            }
            Err(_) => false,
        };
        if responders.contains(&device) && heartbeating {
            list.active.insert(device, info);
        } else {
            list.inactive.insert(device, info);
        }
    }
    Ok(list)
}

/// `"office.sshnp"` → `"office"`.
fn device_from_namespace(namespace: &str) -> Option<String> {
    namespace
        .strip_suffix(".sshnp")
        .map(|device| device.to_string())
}

/// Plain-text rendering for stdout.
pub fn render(list: &DeviceList) -> String {
    let mut out = String::new();
    out.push_str("Active devices:\n");
    if list.active.is_empty() {
        out.push_str("  (none)\n");
    }
    for (device, info) in &list.active {
        out.push_str(&format!(
            "  {device}  v{}  features: {}\n",
            info.version,
            info.supported_features.join(",")
        ));
    }
    out.push_str("Inactive devices:\n");
    if list.inactive.is_empty() {
        out.push_str("  (none)\n");
    }
    for (device, info) in &list.inactive {
        out.push_str(&format!("  {device}  v{}\n", info.version));
    }
    out
}
