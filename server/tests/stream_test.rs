//! End-to-end tests for the WebSocket tail endpoints.
//!
//! A real server is bound to an ephemeral port and driven with a
//! `tokio-tungstenite` client, so the upgrade path, session check and
//! message delivery are exercised the way a browser would see them.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use statushub_server::config::ServerConfig;
use statushub_server::routes::{create_router, AppState};
use statushub_server::settings::{MemorySettingsStore, Settings};
use statushub_server::types::LogRecord;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Helpers
// ============================================================================

struct TestServer {
    state: AppState,
    addr: SocketAddr,
    cookie: String,
}

async fn start_server() -> TestServer {
    let config = ServerConfig {
        session_secret: Some("stream-secret".to_string()),
        ..ServerConfig::default()
    };
    let settings = Settings::create(MemorySettingsStore::new(), "pw").unwrap();
    let state = AppState::new(config, settings);
    let cookie = format!("shsess={}", state.sessions.issue_token());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(state.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer { state, addr, cookie }
}

/// Performs the upgrade handshake, sending `cookie` when given.
async fn connect(
    addr: SocketAddr,
    path: &str,
    cookie: Option<&str>,
) -> Result<Client, WsError> {
    let mut request = format!("ws://{addr}{path}").into_client_request().unwrap();
    if let Some(cookie) = cookie {
        request
            .headers_mut()
            .insert(header::COOKIE, HeaderValue::from_str(cookie).unwrap());
    }
    let (stream, _response) = timeout(WAIT, connect_async(request))
        .await
        .expect("timed out during handshake")?;
    Ok(stream)
}

/// Connects with the server's session cookie and expects the upgrade to succeed.
async fn open(server: &TestServer, path: &str) -> Client {
    connect(server.addr, path, Some(&server.cookie))
        .await
        .expect("WebSocket connect failed")
}

/// Returns the HTTP status of a handshake the server refused.
async fn rejected_status(addr: SocketAddr, path: &str, cookie: Option<&str>) -> StatusCode {
    match connect(addr, path, cookie).await {
        Err(WsError::Http(response)) => response.status(),
        Err(other) => panic!("unexpected handshake error: {other}"),
        Ok(_) => panic!("upgrade to {path} should have been refused"),
    }
}

async fn next_message(ws: &mut Client) -> Option<Message> {
    timeout(WAIT, ws.next())
        .await
        .expect("timed out waiting for message")
        .map(|message| message.unwrap())
}

async fn read_record(ws: &mut Client) -> LogRecord {
    match next_message(ws).await {
        Some(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text message, got {other:?}"),
    }
}

async fn wait_for_listeners(state: &AppState, expected: usize) {
    timeout(WAIT, async {
        while state.store.listener_count() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {expected} stream listeners"));
}

// ============================================================================
// Upgrade
// ============================================================================

#[tokio::test]
async fn upgrade_without_session_is_unauthorized() {
    let server = start_server().await;
    let status = rejected_status(server.addr, "/api/fullStream", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(server.state.store.listener_count(), 0);
}

#[tokio::test]
async fn service_stream_requires_service_parameter() {
    let server = start_server().await;
    let status = rejected_status(server.addr, "/api/serviceStream", Some(&server.cookie)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn full_stream_delivers_new_records_only() {
    let server = start_server().await;
    server.state.store.add("backup", "before connect");

    let mut ws = open(&server, "/api/fullStream").await;
    wait_for_listeners(&server.state, 1).await;

    let id = server.state.store.add("backup", "after connect");
    let record = read_record(&mut ws).await;
    assert_eq!(record.id, id);
    assert_eq!(record.service, "backup");
    assert_eq!(record.message, "after connect");
}

#[tokio::test]
async fn batch_arrives_in_order() {
    let server = start_server().await;
    let mut ws = open(&server, "/api/fullStream").await;
    wait_for_listeners(&server.state, 1).await;

    let ids = server.state.store.add_batch("db", &["one", "two", "three"]);
    for (expected_id, expected_message) in ids.iter().zip(["one", "two", "three"]) {
        let record = read_record(&mut ws).await;
        assert_eq!(record.id, *expected_id);
        assert_eq!(record.message, expected_message);
    }
}

#[tokio::test]
async fn service_stream_skips_other_services() {
    let server = start_server().await;
    let mut ws = open(&server, "/api/serviceStream?service=db").await;
    wait_for_listeners(&server.state, 1).await;

    server.state.store.add("web", "not for us");
    server.state.store.add("db", "vacuum done");

    let record = read_record(&mut ws).await;
    assert_eq!(record.service, "db");
    assert_eq!(record.message, "vacuum done");
}

#[tokio::test]
async fn client_messages_are_ignored() {
    let server = start_server().await;
    let mut ws = open(&server, "/api/fullStream").await;
    wait_for_listeners(&server.state, 1).await;

    ws.send(Message::Text("hello?".into())).await.unwrap();
    server.state.store.add("cron", "tick");

    let record = read_record(&mut ws).await;
    assert_eq!(record.message, "tick");
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn client_close_releases_listener() {
    let server = start_server().await;
    let mut ws = open(&server, "/api/fullStream").await;
    wait_for_listeners(&server.state, 1).await;

    ws.send(Message::Close(None)).await.unwrap();
    wait_for_listeners(&server.state, 0).await;
}

#[tokio::test]
async fn shutdown_closes_open_streams() {
    let server = start_server().await;
    let mut ws = open(&server, "/api/fullStream").await;
    wait_for_listeners(&server.state, 1).await;

    server.state.shutdown.cancel();

    match next_message(&mut ws).await {
        Some(Message::Close(_)) => {}
        other => panic!("expected a close message, got {other:?}"),
    }
    wait_for_listeners(&server.state, 0).await;
}
