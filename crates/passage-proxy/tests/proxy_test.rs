//! Proxy listener lifecycle and bridging tests
//!
//! The listener binds 127.0.0.1 and the upstream echo service sits on
//! 127.0.0.2 at the same port, mirroring how a deployment points
//! `upstream_host` at the machine terminating the tunnel transport.

use chrono::Utc;
use passage_proto::{TunnelRecord, TunnelState};
use passage_proxy::{ProxyConfig, ProxyServer};
use passage_registry::{CreationBus, MemoryRegistry, Registry};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const UPSTREAM_HOST: &str = "127.0.0.2";
const BIND_HOST: &str = "127.0.0.1";

fn test_config() -> ProxyConfig {
    ProxyConfig {
        bind_host: BIND_HOST.to_string(),
        upstream_host: UPSTREAM_HOST.to_string(),
    }
}

fn make_record(id: &str, port: u16) -> TunnelRecord {
    TunnelRecord {
        id: id.to_string(),
        subdomain: "abc123".to_string(),
        status: TunnelState::Active,
        created_at: Utc::now(),
        port,
    }
}

/// Echo server on the upstream host; returns the ephemeral port it bound
async fn spawn_echo_upstream() -> u16 {
    let listener = TcpListener::bind((UPSTREAM_HOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
}

/// Connect to the proxy's public side, retrying while the listener comes up
async fn connect_with_retry(port: u16) -> TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect((BIND_HOST, port)).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("proxy listener on port {port} never came up");
}

async fn seed_registry(registry: &MemoryRegistry, record: &TunnelRecord) {
    registry.put_record(record.clone()).await.unwrap();
    registry.add_active(&record.id).await.unwrap();
}

#[tokio::test]
async fn test_recovery_materializes_listeners_from_active_set() {
    let registry = Arc::new(MemoryRegistry::new());
    let port = spawn_echo_upstream().await;
    seed_registry(&registry, &make_record("t1", port)).await;

    let proxy = ProxyServer::new(registry, test_config());
    proxy.recover().await;

    assert!(proxy.is_serving("t1"));
    assert_eq!(proxy.listener_count(), 1);

    // Bytes flow both ways through the bridge
    let mut client = connect_with_retry(port).await;
    client.write_all(b"hello through the tunnel").await.unwrap();
    let mut buffer = [0u8; 24];
    client.read_exact(&mut buffer).await.unwrap();
    assert_eq!(&buffer, b"hello through the tunnel");
}

#[tokio::test]
async fn test_creation_notification_starts_listener() {
    let registry = Arc::new(MemoryRegistry::new());
    let bus = CreationBus::new();
    let port = spawn_echo_upstream().await;

    let proxy = Arc::new(ProxyServer::new(registry, test_config()));
    let run_proxy = proxy.clone();
    let rx = bus.subscribe();
    tokio::spawn(async move {
        run_proxy.run(rx).await;
    });

    // Give the run loop a moment to subscribe-side settle, then publish
    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.publish(make_record("t2", port));

    let mut client = connect_with_retry(port).await;
    client.write_all(b"ping").await.unwrap();
    let mut buffer = [0u8; 4];
    client.read_exact(&mut buffer).await.unwrap();
    assert_eq!(&buffer, b"ping");
    assert!(proxy.is_serving("t2"));
}

#[tokio::test]
async fn test_duplicate_records_keep_one_listener() {
    let registry = Arc::new(MemoryRegistry::new());
    let port = spawn_echo_upstream().await;
    let record = make_record("t3", port);

    let proxy = ProxyServer::new(registry, test_config());
    proxy.start_listener(record.clone()).await.unwrap();
    proxy.start_listener(record).await.unwrap();

    assert_eq!(proxy.listener_count(), 1);
}

#[tokio::test]
async fn test_stop_listener_closes_public_side() {
    let registry = Arc::new(MemoryRegistry::new());
    let port = spawn_echo_upstream().await;

    let proxy = ProxyServer::new(registry, test_config());
    proxy.start_listener(make_record("t4", port)).await.unwrap();

    let _probe = connect_with_retry(port).await;
    proxy.stop_listener("t4");
    assert!(!proxy.is_serving("t4"));

    // Once the accept loop exits, new public connections are refused
    let mut refused = false;
    for _ in 0..50 {
        if TcpStream::connect((BIND_HOST, port)).await.is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(refused, "listener kept accepting after stop");
}

#[tokio::test]
async fn test_stop_unknown_tunnel_is_noop() {
    let registry = Arc::new(MemoryRegistry::new());
    let proxy = ProxyServer::new(registry, test_config());
    proxy.stop_listener("never-existed");
    assert_eq!(proxy.listener_count(), 0);
}

#[tokio::test]
async fn test_bind_failure_leaves_other_tunnels_served() {
    let registry = Arc::new(MemoryRegistry::new());
    let healthy_port = spawn_echo_upstream().await;

    // Occupy a port so one recovery bind fails
    let blocker = TcpListener::bind((BIND_HOST, 0)).await.unwrap();
    let blocked_port = blocker.local_addr().unwrap().port();

    seed_registry(&registry, &make_record("blocked", blocked_port)).await;
    seed_registry(&registry, &make_record("healthy", healthy_port)).await;

    let proxy = ProxyServer::new(registry, test_config());
    proxy.recover().await;

    assert!(!proxy.is_serving("blocked"));
    assert!(proxy.is_serving("healthy"));
}

#[tokio::test]
async fn test_per_connection_failure_is_isolated() {
    let registry = Arc::new(MemoryRegistry::new());

    // No upstream at all: every bridge fails to dial its companion socket
    let placeholder = TcpListener::bind((UPSTREAM_HOST, 0)).await.unwrap();
    let port = placeholder.local_addr().unwrap().port();
    drop(placeholder);

    let proxy = ProxyServer::new(registry, test_config());
    proxy.start_listener(make_record("t5", port)).await.unwrap();

    // The connection is accepted, the upstream dial fails, and the listener
    // keeps serving
    let _first = connect_with_retry(port).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(proxy.is_serving("t5"));
    let _second = connect_with_retry(port).await;
}
