//! Controller behaviour over an in-memory substrate: allow-list drops,
//! error envelopes for malformed requests, and discovery ping/pong.

use std::sync::Arc;
use std::time::Duration;

use np_core::protocol::{DeviceInfo, ResponsePayload, SessionStatus};
use np_core::{Address, DeviceName, SessionId};
use np_crypto::{PublicKeyRecord, SignedEnvelope, SigningAlgo, SigningKeypair};
use np_daemon::{DaemonConfig, DaemonController};
use np_substrate::keys::response_subscription_pattern;
use np_substrate::{InMemorySubstrate, NotificationKey, Substrate, Subscription};

const DAEMON: &str = "@bob";
const CLIENT: &str = "@alice";

struct Fixture {
    substrate: Arc<InMemorySubstrate>,
    controller: Arc<DaemonController>,
    daemon: Address,
    client: Address,
    device: DeviceName,
}

async fn start_daemon(configure: impl FnOnce(&mut DaemonConfig)) -> Fixture {
    let substrate = Arc::new(InMemorySubstrate::new());
    let daemon: Address = DAEMON.parse().unwrap();
    let client: Address = CLIENT.parse().unwrap();
    let device: DeviceName = "office".parse().unwrap();

    let mut config = DaemonConfig::new(daemon.clone(), device.clone());
    configure(&mut config);

    let keypair = SigningKeypair::generate(SigningAlgo::Ed25519).unwrap();
    let controller = Arc::new(DaemonController::new(config, substrate.clone(), keypair));
    let runner = controller.clone();
    tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    Fixture {
        substrate,
        controller,
        daemon,
        client,
        device,
    }
}

async fn subscribe_response(fixture: &Fixture, session: &SessionId) -> Subscription {
    fixture
        .substrate
        .subscribe(
            &fixture.client,
            &response_subscription_pattern(session, &fixture.device, &fixture.daemon),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn unauthorised_sender_is_silently_dropped() {
    let fixture = start_daemon(|config| {
        config.managers = vec!["@carol".parse().unwrap()];
    })
    .await;

    let session = SessionId::new();
    let mut responses = subscribe_response(&fixture, &session).await;

    let key = NotificationKey::request(&fixture.daemon, &session, &fixture.device, &fixture.client);
    fixture
        .substrate
        .notify(&key, "{\"not\": \"even parsed\"}")
        .await
        .unwrap();

    // No response, no state change, one counted drop.
    let response = tokio::time::timeout(Duration::from_millis(500), responses.next()).await;
    assert!(response.is_err());
    assert_eq!(fixture.controller.metrics().dropped_requests(), 1);
    assert!(fixture.controller.authorized().is_empty().await);
}

#[tokio::test]
async fn malformed_request_gets_a_signed_error_envelope() {
    let fixture = start_daemon(|_| {}).await;

    let session = SessionId::new();
    let mut responses = subscribe_response(&fixture, &session).await;

    let key = NotificationKey::request(&fixture.daemon, &session, &fixture.device, &fixture.client);
    fixture.substrate.notify(&key, "this is not json").await.unwrap();

    let response = tokio::time::timeout(Duration::from_secs(2), responses.next())
        .await
        .unwrap()
        .unwrap();
    let envelope: SignedEnvelope<ResponsePayload> =
        SignedEnvelope::from_json(&response.value).unwrap();

    // The envelope verifies against the key the daemon published.
    let record = fixture
        .substrate
        .signing_public_key(&fixture.daemon)
        .await
        .unwrap()
        .unwrap();
    let record: PublicKeyRecord = serde_json::from_str(&record).unwrap();
    envelope.verify(&record.verifying_key().unwrap()).unwrap();

    assert_eq!(envelope.payload.status, SessionStatus::Error);
    assert_eq!(envelope.payload.session_id, session);
    assert!(envelope.payload.message.unwrap().contains("malformed"));
}

#[tokio::test]
async fn ping_is_answered_with_device_info() {
    let fixture = start_daemon(|_| {}).await;

    let mut pongs = fixture
        .substrate
        .subscribe(&fixture.client, r"^.*:pong\..*$")
        .await
        .unwrap();

    let ping = NotificationKey::ping(&fixture.daemon, &fixture.device, &fixture.client);
    fixture.substrate.notify(&ping, "").await.unwrap();

    let pong = tokio::time::timeout(Duration::from_secs(2), pongs.next())
        .await
        .unwrap()
        .unwrap();
    let info: DeviceInfo = serde_json::from_str(&pong.value).unwrap();
    assert_eq!(info.devicename, "office");
    assert!(info.supported_features.contains(&"ping".to_string()));
}

#[tokio::test]
async fn device_info_record_is_omitted_when_hidden() {
    let hidden = start_daemon(|config| config.hidden = true).await;
    let record = hidden
        .substrate
        .get(&NotificationKey::device_info(
            &hidden.daemon,
            &hidden.device,
            &hidden.daemon,
        ))
        .await
        .unwrap();
    assert!(record.is_none());

    let visible = start_daemon(|_| {}).await;
    let record = visible
        .substrate
        .get(&NotificationKey::device_info(
            &visible.daemon,
            &visible.device,
            &visible.daemon,
        ))
        .await
        .unwrap();
    assert!(record.is_some());
}
