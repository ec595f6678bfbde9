use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use tether_session::SessionManager;
use tether_store::KeyedStore;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::{event_bridge, routes};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8088,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
    pub store: KeyedStore,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/sessions", get(routes::list_sessions))
        .route("/sessions/{id}/start", post(routes::start_session))
        .route("/sessions/{id}/pair", post(routes::pair_session))
        .route("/sessions/{id}/stop", post(routes::stop_session))
        .route("/sessions/{id}/logout", post(routes::logout_session))
        .route("/sessions/{id}/status", get(routes::session_status))
        .route("/store/stats", get(routes::store_stats))
        .route("/events", get(event_bridge::ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve in the background. Port 0 picks a free port.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "tether server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server terminated with error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        port: local_addr.port(),
        shutdown,
        server,
    })
}

/// Handle returned by `start()`; the server runs until [`ServerHandle::shutdown`].
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task ended abnormally");
        }
        tracing::info!("tether server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value};
    use tether_core::{ConnectionError, SessionId};
    use tether_session::loopback::{LoopbackFactory, LoopbackOutcome};
    use tether_session::{BackoffPolicy, ManagerConfig};
    use tether_store::{FsCredentialStore, RegistryFile, StoreConfig};

    struct TestServer {
        handle: ServerHandle,
        factory: Arc<LoopbackFactory>,
        manager: SessionManager,
        store: KeyedStore,
        _dir: tempfile::TempDir,
    }

    impl TestServer {
        fn url(&self, path: &str) -> String {
            format!("http://127.0.0.1:{}{path}", self.handle.port)
        }

        async fn post(&self, path: &str) -> (u16, Value) {
            let resp = reqwest::Client::new().post(self.url(path)).send().await.unwrap();
            (resp.status().as_u16(), resp.json().await.unwrap())
        }

        async fn get(&self, path: &str) -> (u16, Value) {
            let resp = reqwest::get(self.url(path)).await.unwrap();
            (resp.status().as_u16(), resp.json().await.unwrap())
        }
    }

    async fn boot(factory: LoopbackFactory) -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(factory);
        let manager = SessionManager::new(
            ManagerConfig {
                concurrency: 2,
                settle_delay: Duration::ZERO,
                backoff: BackoffPolicy::new(Duration::from_millis(50), Duration::from_secs(1)),
                start_timeout: Some(Duration::from_millis(200)),
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

        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        let state = AppState {
            manager: manager.clone(),
            store: store.clone(),
        };
        let handle = start(config, state).await.unwrap();
        TestServer {
            handle,
            factory,
            manager,
            store,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let server = boot(LoopbackFactory::new()).await;
        server.manager.register(&SessionId::parse("1").unwrap()).await;

        let (status, body) = server.get("/health").await;
        assert_eq!(status, 200);
        assert_eq!(body, json!({"ok": true, "sessions": 1, "running": 0}));
    }

    #[tokio::test]
    async fn start_status_stop_roundtrip() {
        let server = boot(LoopbackFactory::new()).await;

        let (status, body) = server.post("/sessions/4915/start").await;
        assert_eq!(status, 200);
        assert_eq!(body["ok"], true);
        assert_eq!(body["id"], "4915");
        assert_eq!(body["status"], "connected");

        let (status, body) = server.get("/sessions/4915/status").await;
        assert_eq!(status, 200);
        assert_eq!(body["running"], true);
        assert_eq!(body["backoffMs"], 50);

        let (_, body) = server.get("/sessions").await;
        assert_eq!(body["sessions"][0]["id"], "4915");
        assert!(body["sessions"][0]["updatedAt"].is_string());

        let (status, body) = server.post("/sessions/4915/stop").await;
        assert_eq!(status, 200);
        assert_eq!(body, json!({"ok": true, "id": "4915", "stopped": true}));

        let (_, body) = server.post("/sessions/4915/stop").await;
        assert_eq!(body["stopped"], false);
    }

    #[tokio::test]
    async fn logout_unknown_is_404() {
        let server = boot(LoopbackFactory::new()).await;
        let (status, body) = server.post("/sessions/999/logout").await;
        assert_eq!(status, 404);
        assert_eq!(body["ok"], false);
        assert!(body["error"].as_str().unwrap().contains("999"));

        server.post("/sessions/999/start").await;
        let (status, body) = server.post("/sessions/999/logout").await;
        assert_eq!(status, 200);
        assert_eq!(body, json!({"ok": true, "id": "999"}));
        let (status, _) = server.get("/sessions/999/status").await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn invalid_id_is_400() {
        let server = boot(LoopbackFactory::new()).await;
        let (status, body) = server.post("/sessions/bad%20id/start").await;
        assert_eq!(status, 400);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn factory_errors_map_to_gateway_statuses() {
        let server = boot(LoopbackFactory::new()).await;
        let failing = SessionId::parse("f1").unwrap();
        let hanging = SessionId::parse("h1").unwrap();
        server.factory.script(
            &failing,
            LoopbackOutcome::Fail(ConnectionError::Network("refused".into())),
        );
        server.factory.script(&hanging, LoopbackOutcome::Hang);

        let (status, body) = server.post("/sessions/f1/start").await;
        assert_eq!(status, 502);
        assert_eq!(body["ok"], false);

        let (status, _) = server.post("/sessions/h1/start").await;
        assert_eq!(status, 504);
    }

    #[tokio::test]
    async fn pair_returns_code() {
        let server = boot(LoopbackFactory::new()).await;
        let resp = reqwest::Client::new()
            .post(server.url("/sessions/77/pair"))
            .json(&json!({"phone": "+49 151 2345 6789"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"ok": true, "id": "77", "code": "LB456789"}));
    }

    #[tokio::test]
    async fn store_stats_reflect_contents() {
        let server = boot(LoopbackFactory::new()).await;
        server.store.set("chat-1", "m1", json!({"text": "hi"}));
        server.store.set("chat-1", "m2", json!(2));
        server.store.set("chat-2", "m1", json!(3));
        server.store.flush().unwrap();

        let (status, body) = server.get("/store/stats").await;
        assert_eq!(status, 200);
        assert_eq!(body["owners"], 2);
        assert_eq!(body["keys"], 3);
        assert!(body["writes"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn shutdown_stops_serving() {
        let server = boot(LoopbackFactory::new()).await;
        let url = server.url("/health");
        server.handle.shutdown().await;
        assert!(reqwest::get(&url).await.is_err());
    }
}
