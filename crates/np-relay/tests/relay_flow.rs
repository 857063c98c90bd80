//! Integration tests for the rendezvous relay: allocation, socket auth,
//! splice, and teardown, over an in-memory substrate and real TCP sockets.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use np_core::protocol::{AuthPayload, RvdAllocation, RvdRequest};
use np_core::{Address, DeviceName, SessionId};
use np_crypto::{
    HashingAlgo, PublicKeyRecord, SignedEnvelope, SigningAlgo, SigningKeypair,
};
use np_substrate::keys::rvd_reply_subscription_pattern;
use np_substrate::{InMemorySubstrate, NotificationKey, Substrate};
use np_relay::{RelayConfig, RelayServer};

struct Principal {
    address: Address,
    keypair: SigningKeypair,
}

async fn principal(substrate: &InMemorySubstrate, address: &str) -> Principal {
    let address: Address = address.parse().unwrap();
    let keypair = SigningKeypair::generate(SigningAlgo::Ed25519).unwrap();
    let record = serde_json::to_string(&PublicKeyRecord::for_keypair(&keypair).unwrap()).unwrap();
    substrate.register_principal(&address, &record).await.unwrap();
    Principal { address, keypair }
}

async fn start_relay(
    substrate: Arc<InMemorySubstrate>,
    relay_address: &Address,
    auth_timeout_secs: u64,
) -> Arc<RelayServer> {
    let mut config = RelayConfig::new(relay_address.clone(), "127.0.0.1".parse().unwrap());
    config.bind_ip = "127.0.0.1".parse().unwrap();
    config.auth_timeout_secs = auth_timeout_secs;
    let server = Arc::new(RelayServer::new(config, substrate));
    let runner = server.clone();
    tokio::spawn(async move { runner.run().await });
    // Let the server's subscription land before the first request.
    tokio::time::sleep(Duration::from_millis(100)).await;
    server
}

async fn request_allocation(
    substrate: &InMemorySubstrate,
    client: &Principal,
    daemon: &Principal,
    relay: &Address,
    device: &DeviceName,
    session: SessionId,
) -> Option<RvdAllocation> {
    let mut replies = substrate
        .subscribe(
            &client.address,
            &rvd_reply_subscription_pattern(&session, device, relay),
        )
        .await
        .unwrap();

    let request = RvdRequest {
        session_id: session,
        daemon_address: daemon.address.clone(),
        client_nonce: None,
    };
    let key = NotificationKey::rvd_request(relay, device, &client.address);
    substrate
        .notify(&key, &serde_json::to_string(&request).unwrap())
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), replies.next())
        .await
        .ok()??;
    Some(reply.value.parse().unwrap())
}

async fn connect_and_auth(
    port: u16,
    keypair: &SigningKeypair,
    session: SessionId,
    nonce: &str,
) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let payload = AuthPayload {
        session_id: session,
        rvd_nonce: nonce.to_string(),
        client_nonce: None,
    };
    let envelope = SignedEnvelope::sign(payload, HashingAlgo::Sha256, keypair).unwrap();
    let line = format!("{}\n", envelope.to_json().unwrap());
    stream.write_all(line.as_bytes()).await.unwrap();
    stream
}

#[tokio::test]
async fn happy_path_authenticates_both_sides_and_splices() {
    let substrate = Arc::new(InMemorySubstrate::new());
    let client = principal(&substrate, "@alice").await;
    let daemon = principal(&substrate, "@bob").await;
    let relay_address: Address = "@rvd".parse().unwrap();
    let device: DeviceName = "office".parse().unwrap();

    let server = start_relay(substrate.clone(), &relay_address, 30).await;

    let session = SessionId::new();
    let alloc = request_allocation(&substrate, &client, &daemon, &relay_address, &device, session)
        .await
        .expect("allocation reply");

    let mut client_sock =
        connect_and_auth(alloc.port_a, &client.keypair, session, &alloc.nonce).await;
    let mut daemon_sock =
        connect_and_auth(alloc.port_b, &daemon.keypair, session, &alloc.nonce).await;

    client_sock.write_all(b"from-client").await.unwrap();
    let mut buf = [0u8; 11];
    daemon_sock.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"from-client");

    daemon_sock.write_all(b"from-daemon").await.unwrap();
    client_sock.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"from-daemon");

    // Closing one side ends the splice and frees the allocation.
    drop(client_sock);
    drop(daemon_sock);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.allocations().count(), 0);
    assert_eq!(server.metrics().auth_failures(), 0);
}

#[tokio::test]
async fn lone_side_is_torn_down_when_the_window_expires() {
    let substrate = Arc::new(InMemorySubstrate::new());
    let client = principal(&substrate, "@alice").await;
    let daemon = principal(&substrate, "@bob").await;
    let relay_address: Address = "@rvd".parse().unwrap();
    let device: DeviceName = "office".parse().unwrap();

    let server = start_relay(substrate.clone(), &relay_address, 1).await;

    let session = SessionId::new();
    let alloc = request_allocation(&substrate, &client, &daemon, &relay_address, &device, session)
        .await
        .expect("allocation reply");
    assert_eq!(server.allocations().count(), 1);

    // Only the client ever shows up.
    let mut client_sock =
        connect_and_auth(alloc.port_a, &client.keypair, session, &alloc.nonce).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(server.allocations().count(), 0);

    // The relay closed our socket along with the allocation (EOF, or a
    // reset depending on timing).
    let mut buf = [0u8; 1];
    assert_eq!(client_sock.read(&mut buf).await.unwrap_or(0), 0);
}

#[tokio::test]
async fn tampered_signature_closes_the_socket_and_counts_the_failure() {
    let substrate = Arc::new(InMemorySubstrate::new());
    let client = principal(&substrate, "@alice").await;
    let daemon = principal(&substrate, "@bob").await;
    let relay_address: Address = "@rvd".parse().unwrap();
    let device: DeviceName = "office".parse().unwrap();

    let server = start_relay(substrate.clone(), &relay_address, 30).await;

    let session = SessionId::new();
    let alloc = request_allocation(&substrate, &client, &daemon, &relay_address, &device, session)
        .await
        .expect("allocation reply");

    // A key the relay has never seen signs an otherwise valid envelope.
    let imposter = SigningKeypair::generate(SigningAlgo::Ed25519).unwrap();
    let mut bad_sock = connect_and_auth(alloc.port_a, &imposter, session, &alloc.nonce).await;

    let mut buf = [0u8; 1];
    assert_eq!(bad_sock.read(&mut buf).await.unwrap_or(0), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.metrics().auth_failures(), 1);
    assert_eq!(server.allocations().count(), 0);
}

#[tokio::test]
async fn unknown_peer_gets_no_allocation() {
    let substrate = Arc::new(InMemorySubstrate::new());
    let client = principal(&substrate, "@alice").await;
    let relay_address: Address = "@rvd".parse().unwrap();
    let device: DeviceName = "office".parse().unwrap();

    // The daemon never published a key.
    let ghost = Principal {
        address: "@ghost".parse().unwrap(),
        keypair: SigningKeypair::generate(SigningAlgo::Ed25519).unwrap(),
    };

    let server = start_relay(substrate.clone(), &relay_address, 30).await;

    let session = SessionId::new();
    let reply =
        request_allocation(&substrate, &client, &ghost, &relay_address, &device, session).await;
    assert!(reply.is_none());
    assert_eq!(server.allocations().count(), 0);
}
