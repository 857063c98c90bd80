//! Three-party session establishment over one in-memory substrate: the
//! client orchestrator, the daemon controller (fronting a fake sshd), and
//! a real rendezvous relay splicing real TCP sockets.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use np_client::{discovery, ClientConfig, SessionError, SessionOrchestrator};
use np_core::protocol::DeviceInfo;
use np_core::{Address, DeviceName};
use np_crypto::{PublicKeyRecord, SigningAlgo, SigningKeypair};
use np_daemon::{DaemonConfig, DaemonController};
use np_relay::{RelayConfig, RelayServer};
use np_substrate::{InMemorySubstrate, NotificationKey, Substrate};

/// A stand-in for the device's sshd: accepts connections and echoes.
async fn spawn_fake_sshd() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

async fn start_relay(substrate: Arc<InMemorySubstrate>) -> Address {
    let relay_address: Address = "@rvd".parse().unwrap();
    let mut config = RelayConfig::new(relay_address.clone(), "127.0.0.1".parse().unwrap());
    config.bind_ip = "127.0.0.1".parse().unwrap();
    let server = Arc::new(RelayServer::new(config, substrate));
    tokio::spawn(async move { server.run().await });
    relay_address
}

async fn start_daemon(
    substrate: Arc<InMemorySubstrate>,
    device: &DeviceName,
    sshd_port: u16,
) -> (Address, Arc<DaemonController>) {
    let daemon_address: Address = "@bob".parse().unwrap();
    let mut config = DaemonConfig::new(daemon_address.clone(), device.clone());
    config.sshd_port = sshd_port;
    let keypair = SigningKeypair::generate(SigningAlgo::Ed25519).unwrap();
    let controller = Arc::new(DaemonController::new(config, substrate, keypair));
    let runner = controller.clone();
    tokio::spawn(async move { runner.run().await });
    (daemon_address, controller)
}

async fn register_client(substrate: &InMemorySubstrate) -> (Address, SigningKeypair) {
    let address: Address = "@alice".parse().unwrap();
    let keypair = SigningKeypair::generate(SigningAlgo::Ed25519).unwrap();
    let record = serde_json::to_string(&PublicKeyRecord::for_keypair(&keypair).unwrap()).unwrap();
    substrate.register_principal(&address, &record).await.unwrap();
    (address, keypair)
}

#[tokio::test]
async fn direct_session_reaches_the_device_sshd() {
    let substrate = Arc::new(InMemorySubstrate::new());
    let device: DeviceName = "office".parse().unwrap();
    let sshd_port = spawn_fake_sshd().await;

    let _relay = start_relay(substrate.clone()).await;
    let (daemon_address, daemon) = start_daemon(substrate.clone(), &device, sshd_port).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let (client_address, client_keys) = register_client(&substrate).await;
    let state_dir = tempfile::tempdir().unwrap();
    let mut config = ClientConfig::new(client_address, daemon_address, device, "@rvd");
    config.state_dir = state_dir.path().to_path_buf();

    let orchestrator = SessionOrchestrator::new(config, substrate.clone(), client_keys);
    let cleanup = orchestrator.cleanup();
    let outcome = orchestrator.run().await.expect("session should establish");

    // A real local port, an ephemeral identity, and a runnable command.
    assert!(outcome.local_port > 0);
    let identity = outcome.identity_file.clone().expect("ephemeral identity");
    let key_text = std::fs::read_to_string(&identity).unwrap();
    assert!(key_text.contains("OPENSSH PRIVATE KEY"));
    assert!(outcome
        .ssh_command
        .contains(&format!("-p {}", outcome.local_port)));

    // Bytes entering the local port come back from the device's sshd:
    // local listener -> relay portA -> splice -> portB -> daemon -> sshd.
    let mut conn = TcpStream::connect(("127.0.0.1", outcome.local_port))
        .await
        .unwrap();
    conn.write_all(b"SSH-2.0-probe\r\n").await.unwrap();
    let mut echoed = [0u8; 15];
    conn.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"SSH-2.0-probe\r\n");

    // The session's authorised-key entry exists while the session lives.
    assert_eq!(daemon.authorized().len().await, 1);

    drop(conn);
    cleanup.run().await;
    assert!(!identity.exists());

    // Once the bridge drains, the daemon's cleanup removes its entry.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(daemon.authorized().is_empty().await);
}

#[tokio::test]
async fn daemon_failure_surfaces_as_a_remote_error() {
    let substrate = Arc::new(InMemorySubstrate::new());
    let device: DeviceName = "office".parse().unwrap();

    // A port with nothing behind it stands in for a dead sshd.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = probe.local_addr().unwrap().port();
    drop(probe);

    let _relay = start_relay(substrate.clone()).await;
    let (daemon_address, _daemon) = start_daemon(substrate.clone(), &device, dead_port).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let (client_address, client_keys) = register_client(&substrate).await;
    let state_dir = tempfile::tempdir().unwrap();
    let mut config = ClientConfig::new(client_address, daemon_address, device, "@rvd");
    config.state_dir = state_dir.path().to_path_buf();

    let orchestrator = SessionOrchestrator::new(config, substrate.clone(), client_keys);
    let error = orchestrator.run().await.expect_err("session should fail");
    match &error {
        SessionError::Remote(message) => assert!(message.contains("sshd")),
        other => panic!("expected a remote error, got {other}"),
    }
    assert_eq!(error.exit_code(), np_client::ExitCode::Remote);
}

#[tokio::test]
async fn discovery_separates_active_and_inactive_devices() {
    let substrate = Arc::new(InMemorySubstrate::new());
    let device: DeviceName = "office".parse().unwrap();
    let sshd_port = spawn_fake_sshd().await;

    let (daemon_address, _daemon) = start_daemon(substrate.clone(), &device, sshd_port).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    // A second device that only ever left a record behind.
    let garage: DeviceName = "garage".parse().unwrap();
    let stale = DeviceInfo {
        devicename: "garage".to_string(),
        version: "4.0.5".to_string(),
        core_package_version: "4.0.5".to_string(),
        supported_features: vec!["reverse".to_string()],
    };
    substrate
        .put(
            &NotificationKey::device_info(&daemon_address, &garage, &daemon_address),
            &serde_json::to_string(&stale).unwrap(),
            None,
        )
        .await
        .unwrap();

    let client_address: Address = "@alice".parse().unwrap();
    let list = discovery::list_devices(
        substrate.as_ref(),
        &client_address,
        &daemon_address,
        Duration::from_millis(400),
    )
    .await
    .unwrap();

    assert!(list.active.contains_key("office"));
    assert_eq!(list.active["office"].version, env!("CARGO_PKG_VERSION"));
    assert!(list.inactive.contains_key("garage"));
    assert_eq!(list.inactive["garage"].version, "4.0.5");
}
