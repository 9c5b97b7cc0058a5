//! Listener lifecycle tests against a real loopback socket.

use remote_tls::{
    Config, Dispatcher, Error, HttpsConfig, ListenerState, MemorySecretStore, Paths,
    RemoteControlServer, SecureConnection, StatusDispatcher,
};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Counts connections, remembers the SNI of the last one and closes them immediately.
#[derive(Default)]
struct CountingDispatcher {
    seen: AtomicUsize,
    last_server_name: Mutex<Option<String>>,
}

impl Dispatcher for CountingDispatcher {
    fn dispatch(&self, connection: SecureConnection) {
        assert!(connection.protocol_version().is_some());
        *self.last_server_name.lock().unwrap() = connection.server_name();
        self.seen.fetch_add(1, Ordering::SeqCst);
        drop(connection);
    }
}

struct Harness {
    _dir: TempDir,
    paths: Paths,
    secrets: Arc<MemorySecretStore>,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let paths = Paths::from_base(dir.path().join("data"));
        Harness {
            _dir: dir,
            paths,
            secrets: Arc::new(MemorySecretStore::new()),
        }
    }

    fn server(&self, dispatcher: Arc<dyn Dispatcher>) -> RemoteControlServer {
        let https = HttpsConfig {
            host: "127.0.0.1".into(),
            ..Config::default().https
        };
        RemoteControlServer::new(self.paths.clone(), &https, self.secrets.clone(), dispatcher)
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn port_is_free(addr: SocketAddr) -> bool {
    std::net::TcpListener::bind(addr).is_ok()
}

async fn handshake(
    server: &RemoteControlServer,
    addr: SocketAddr,
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let connector = tokio_rustls::TlsConnector::from(server.client_config().await.unwrap());
    let stream = TcpStream::connect(addr).await.unwrap();
    connector
        .connect(ServerName::try_from("localhost").unwrap(), stream)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_start_accepts_and_dispatches() {
    let harness = Harness::new();
    let dispatcher = Arc::new(CountingDispatcher::default());
    let server = harness.server(dispatcher.clone());

    assert_eq!(server.state(), ListenerState::Stopped);
    let addr = server.start(free_port()).await.unwrap();
    assert_eq!(server.state(), ListenerState::Running);
    assert!(addr.ip().is_loopback());
    assert_eq!(server.local_addr().await, Some(addr));
    assert!(harness.paths.keystore.exists());

    let mut tls = handshake(&server, addr).await;
    // The dispatcher drops the connection, so the read ends
    let mut buf = Vec::new();
    let _ = tls.read_to_end(&mut buf).await;

    assert_eq!(dispatcher.seen.load(Ordering::SeqCst), 1);
    assert_eq!(
        dispatcher.last_server_name.lock().unwrap().as_deref(),
        Some("localhost")
    );
    server.stop().await;
}

#[tokio::test]
async fn test_status_dispatcher_answers_http() {
    let harness = Harness::new();
    let server = harness.server(Arc::new(StatusDispatcher::default()));
    let addr = server.start(free_port()).await.unwrap();

    let mut tls = handshake(&server, addr).await;
    tls.write_all(b"GET /version HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    tls.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("\"name\":\"remote-tls\""), "{}", response);
    server.stop().await;
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let harness = Harness::new();
    let server = harness.server(Arc::new(CountingDispatcher::default()));
    let addr = server.start(free_port()).await.unwrap();

    let err = server.start(free_port()).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyRunning { addr: a } if a == addr));
    assert_eq!(server.state(), ListenerState::Running);
    assert_eq!(server.local_addr().await, Some(addr));

    server.stop().await;
}

#[tokio::test]
async fn test_restart_moves_to_new_port_and_frees_old() {
    let harness = Harness::new();
    let server = harness.server(Arc::new(CountingDispatcher::default()));
    let old = server.start(free_port()).await.unwrap();
    let keystore = std::fs::read(&harness.paths.keystore).unwrap();

    let new = server.restart(free_port()).await.unwrap().unwrap();
    assert_ne!(old.port(), new.port());
    assert_eq!(server.state(), ListenerState::Running);
    assert!(port_is_free(old), "old port still bound");

    // Same identity across restarts
    assert_eq!(std::fs::read(&harness.paths.keystore).unwrap(), keystore);
    handshake(&server, new).await;

    server.stop().await;
}

#[tokio::test]
async fn test_bind_conflict_leaves_stopped() {
    let harness = Harness::new();
    let server = harness.server(Arc::new(CountingDispatcher::default()));

    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let err = server.start(port).await.unwrap_err();
    assert!(err.is_bind_conflict(), "{}", err);
    assert_eq!(server.state(), ListenerState::Stopped);
    assert_eq!(server.local_addr().await, None);

    // Retry after the port frees up
    drop(occupied);
    server.start(port).await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_restart_onto_occupied_port_stops_listener() {
    let harness = Harness::new();
    let server = harness.server(Arc::new(CountingDispatcher::default()));
    let old = server.start(free_port()).await.unwrap();

    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let err = server.restart(port).await.unwrap_err();
    assert!(err.is_bind_conflict(), "{}", err);
    assert_eq!(server.state(), ListenerState::Stopped);
    assert_eq!(server.local_addr().await, None);
    assert!(port_is_free(old), "old port still bound");

    drop(occupied);
}

#[tokio::test]
async fn test_stop_is_idempotent_and_releases_port() {
    let harness = Harness::new();
    let server = harness.server(Arc::new(CountingDispatcher::default()));

    server.stop().await;
    assert_eq!(server.state(), ListenerState::Stopped);

    let addr = server.start(free_port()).await.unwrap();
    server.stop().await;
    server.stop().await;

    assert_eq!(server.state(), ListenerState::Stopped);
    assert!(port_is_free(addr));
}

#[tokio::test]
async fn test_restart_when_disabled_stays_stopped() {
    let harness = Harness::new();
    let server = harness.server(Arc::new(CountingDispatcher::default()));
    let addr = server.start(free_port()).await.unwrap();

    server.set_enabled(false);
    assert_eq!(server.restart(free_port()).await.unwrap(), None);
    assert_eq!(server.state(), ListenerState::Stopped);
    assert!(port_is_free(addr));
}

#[tokio::test]
async fn test_state_transitions_are_observable() {
    let harness = Harness::new();
    let server = harness.server(Arc::new(CountingDispatcher::default()));
    let mut states = server.subscribe();

    server.start(free_port()).await.unwrap();
    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ListenerState::Running);

    server.stop().await;
    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ListenerState::Stopped);
}

#[tokio::test]
async fn test_corrupt_keystore_is_not_regenerated() {
    let harness = Harness::new();
    std::fs::create_dir_all(&harness.paths.base).unwrap();
    std::fs::write(&harness.paths.keystore, b"garbage").unwrap();

    let server = harness.server(Arc::new(CountingDispatcher::default()));
    let err = server.start(free_port()).await.unwrap_err();

    assert!(matches!(err, Error::KeystoreCorrupt { .. }), "{}", err);
    assert_eq!(server.state(), ListenerState::Stopped);
    assert_eq!(std::fs::read(&harness.paths.keystore).unwrap(), b"garbage");
}
