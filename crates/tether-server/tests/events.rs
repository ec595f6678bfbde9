//! End-to-end check of the `/events` WebSocket stream.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tether_core::{CloseReason, SessionId};
use tether_server::{start, AppState, ServerConfig, ServerHandle};
use tether_session::loopback::LoopbackFactory;
use tether_session::{ManagerConfig, SessionManager};
use tether_store::{FsCredentialStore, KeyedStore, RegistryFile, StoreConfig};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn boot(dir: &tempfile::TempDir) -> (ServerHandle, SessionManager, Arc<LoopbackFactory>) {
    let factory = Arc::new(LoopbackFactory::new());
    let manager = SessionManager::new(
        ManagerConfig {
            settle_delay: Duration::ZERO,
            ..Default::default()
        },
        factory.clone(),
        Arc::new(FsCredentialStore::new(dir.path().join("auth"))),
        RegistryFile::new(dir.path().join("sessions.json")),
    );
    let store = KeyedStore::open(StoreConfig {
        path: dir.path().join("store.json"),
        ..Default::default()
    })
    .unwrap();
    let handle = start(
        ServerConfig {
            port: 0,
            ..Default::default()
        },
        AppState {
            manager: manager.clone(),
            store,
        },
    )
    .await
    .unwrap();
    (handle, manager, factory)
}

async fn next_event(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// The server subscribes during the upgrade; give it a moment before emitting.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn streams_session_events_as_json() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, manager, factory) = boot(&dir).await;
    let (mut ws, _) = connect_async(format!("ws://{}/events", handle.addr))
        .await
        .unwrap();
    settle().await;

    let id = SessionId::parse("4901").unwrap();
    manager.start(&id).await.unwrap();

    let first = next_event(&mut ws).await;
    assert_eq!(first["type"], "connection_update");
    assert_eq!(first["update"]["connection"], "open");
    let second = next_event(&mut ws).await;
    assert_eq!(second["type"], "connected");
    assert_eq!(second["session_id"], "4901");

    factory
        .latest(&id)
        .unwrap()
        .close_with(CloseReason::status(401))
        .await;
    let update = next_event(&mut ws).await;
    assert_eq!(update["update"]["closeReason"]["statusCode"], 401);
    let deleted = next_event(&mut ws).await;
    assert_eq!(deleted["type"], "session_deleted");

    ws.close(None).await.unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn session_filter_skips_other_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, manager, _factory) = boot(&dir).await;
    let (mut ws, _) = connect_async(format!("ws://{}/events?session=b", handle.addr))
        .await
        .unwrap();
    settle().await;

    manager.start(&SessionId::parse("a").unwrap()).await.unwrap();
    manager.start(&SessionId::parse("b").unwrap()).await.unwrap();

    for _ in 0..2 {
        let event = next_event(&mut ws).await;
        assert_eq!(event["session_id"], "b");
    }

    let _ = ws.send(Message::Close(None)).await;
    handle.shutdown().await;
}
