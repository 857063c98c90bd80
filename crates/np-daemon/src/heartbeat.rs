//! Heartbeat and device-info publication.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use np_core::protocol::DeviceInfo;
use np_core::timeouts;
use np_substrate::{NotificationKey, Substrate};

use crate::config::DaemonConfig;
use crate::{CORE_PACKAGE_VERSION, SUPPORTED_FEATURES};

/// Freshness window for the shared heartbeat record; a device whose record
/// has expired is considered inactive by discovery.
pub const HEARTBEAT_RECORD_TTL: Duration = Duration::from_secs(90);

pub fn device_info(config: &DaemonConfig) -> DeviceInfo {
    DeviceInfo {
        devicename: config.device.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        core_package_version: CORE_PACKAGE_VERSION.to_string(),
        supported_features: SUPPORTED_FEATURES.iter().map(|s| s.to_string()).collect(),
    }
}

/// Publish a heartbeat every 30 s until shutdown: a fresh shared record
/// for pollers, plus a notification to each configured manager.
pub async fn heartbeat_task(
    config: Arc<DaemonConfig>,
    substrate: Arc<dyn Substrate>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(timeouts::HEARTBEAT_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                publish_heartbeat(&config, substrate.as_ref()).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

pub async fn publish_heartbeat(config: &DaemonConfig, substrate: &dyn Substrate) {
    let value = match serde_json::to_string(&device_info(config)) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "device info did not serialise");
            return;
        }
    };

    let record_key =
        NotificationKey::heartbeat(&config.address, &config.device, &config.address);
    if let Err(e) = substrate
        .put(&record_key, &value, Some(HEARTBEAT_RECORD_TTL))
        .await
    {
        warn!(error = %e, "heartbeat record publish failed");
    }

    for manager in &config.managers {
        let key = NotificationKey::heartbeat(manager, &config.device, &config.address);
        if let Err(e) = substrate.notify(&key, &value).await {
            debug!(manager = %manager, error = %e, "heartbeat notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use np_substrate::InMemorySubstrate;

    #[tokio::test]
    async fn heartbeat_record_is_fresh_and_describes_the_device() {
        let config = DaemonConfig::new("@bob".parse().unwrap(), "office".parse().unwrap());
        let substrate = InMemorySubstrate::new();

        publish_heartbeat(&config, &substrate).await;

        let key = NotificationKey::heartbeat(&config.address, &config.device, &config.address);
        let raw = substrate.get(&key).await.unwrap().expect("record present");
        let info: DeviceInfo = serde_json::from_str(&raw).unwrap();
        assert_eq!(info.devicename, "office");
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
        assert!(info.supported_features.contains(&"direct".to_string()));
    }
}
