//! Session lifecycle: bounded starts, reconnect with backoff, and cleanup of
//! sessions whose credentials were revoked.
//!
//! Every live connection gets one task draining its event channel, so the
//! events of a connection are handled strictly in arrival order. Each
//! connection is stamped with a generation; events from a connection that has
//! since been stopped or replaced are dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tether_core::{
    CloseReason, Connection, ConnectionEvent, ConnectionFactory, ConnectionHandle,
    ConnectionState, ConnectionUpdate, SessionEvent, SessionId,
};
use tether_store::{CredentialStore, RegistryFile};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::BackoffPolicy;
use crate::classify::{classify_close, CloseKind};
use crate::entry::{SessionEntry, SessionStatus, SessionSummary};
use crate::error::SessionError;
use crate::semaphore::Semaphore;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Maximum number of starts in progress at once.
    pub concurrency: usize,
    /// How long a start keeps its slot after the connection is created.
    pub settle_delay: Duration,
    pub backoff: BackoffPolicy,
    /// Upper bound on a single factory call. `None` waits indefinitely.
    pub start_timeout: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            settle_delay: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
            start_timeout: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StartOrigin {
    Caller,
    Reconnect,
}

/// Cheap-to-clone handle to the session registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ManagerConfig,
    factory: Arc<dyn ConnectionFactory>,
    credentials: Arc<dyn CredentialStore>,
    registry_file: RegistryFile,
    semaphore: Semaphore,
    sessions: Mutex<IndexMap<SessionId, SessionEntry>>,
    /// Orders registry snapshots so a stale id list never lands last.
    persist_lock: AsyncMutex<()>,
    events: broadcast::Sender<SessionEvent>,
    generations: AtomicU64,
    shutting_down: AtomicBool,
}

impl SessionManager {
    /// Build a manager, restoring registered ids from `registry_file`.
    /// Restored sessions are stopped until started.
    pub fn new(
        config: ManagerConfig,
        factory: Arc<dyn ConnectionFactory>,
        credentials: Arc<dyn CredentialStore>,
        registry_file: RegistryFile,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut sessions = IndexMap::new();
        for id in registry_file.load() {
            sessions.insert(id.clone(), SessionEntry::new(id, config.backoff.base));
        }
        if !sessions.is_empty() {
            info!(
                count = sessions.len(),
                path = %registry_file.path().display(),
                "restored session registry"
            );
        }

        Self {
            inner: Arc::new(Inner {
                semaphore: Semaphore::new(config.concurrency),
                config,
                factory,
                credentials,
                registry_file,
                sessions: Mutex::new(sessions),
                persist_lock: AsyncMutex::new(()),
                events,
                generations: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Starts currently holding a concurrency slot.
    pub fn active_starts(&self) -> usize {
        self.inner.semaphore.active()
    }

    /// Add a stopped entry for `id` if it is not known yet. Returns whether
    /// an entry was created.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn register(&self, id: &SessionId) -> bool {
        let created = {
            let mut sessions = self.inner.sessions.lock();
            if sessions.contains_key(id) {
                false
            } else {
                sessions.insert(
                    id.clone(),
                    SessionEntry::new(id.clone(), self.inner.config.backoff.base),
                );
                true
            }
        };
        if created {
            info!("session registered");
            self.persist_registry().await;
        }
        created
    }

    /// Return the live connection for `id`, creating one if needed.
    ///
    /// Concurrent calls for the same id share a single creation. The start
    /// runs on its own task so an abandoned caller cannot leave the session
    /// half started.
    pub async fn start(&self, id: &SessionId) -> Result<Arc<dyn Connection>, SessionError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(SessionError::ShuttingDown);
        }
        if let Some(connection) = self.live_connection(id) {
            return Ok(connection);
        }
        self.register(id).await;

        let this = self.clone();
        let id = id.clone();
        tokio::spawn(async move { this.start_session(&id, StartOrigin::Caller).await })
            .await
            .map_err(|e| SessionError::Internal(format!("start task failed: {e}")))?
    }

    /// Start every registered session, `concurrency` at a time. A batch
    /// finishes before the next one begins. Returns how many started.
    #[instrument(skip(self))]
    pub async fn start_all(&self) -> usize {
        let ids = self.session_ids();
        let mut started = 0;
        for batch in ids.chunks(self.inner.semaphore.limit()) {
            let results = join_all(batch.iter().map(|id| self.start(id))).await;
            for (id, result) in batch.iter().zip(results) {
                match result {
                    Ok(_) => started += 1,
                    Err(e) => error!(session_id = %id, error = %e, "failed to start session"),
                }
            }
        }
        info!(started, total = ids.len(), "start_all finished");
        started
    }

    /// Close the live connection without deleting credentials. Cancels any
    /// pending reconnect. Returns whether a connection was running.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn stop(&self, id: &SessionId) -> bool {
        let connection = {
            let mut sessions = self.inner.sessions.lock();
            let Some(entry) = sessions.get_mut(id) else {
                return false;
            };
            entry.cancel_reconnect();
            match entry.connection.take() {
                Some(connection) => {
                    entry.set_status(SessionStatus::Stopping);
                    connection
                }
                None => {
                    if entry.status != SessionStatus::Stopped {
                        entry.set_status(SessionStatus::Stopped);
                    }
                    return false;
                }
            }
        };

        if let Err(e) = connection.close().await {
            debug!(error = %e, "close failed during stop");
        }
        if let Some(entry) = self.inner.sessions.lock().get_mut(id) {
            if entry.status == SessionStatus::Stopping {
                entry.set_status(SessionStatus::Stopped);
            }
        }
        info!("session stopped");
        true
    }

    /// Log the session out, delete its credentials and forget it.
    /// Returns false when the session is unknown.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn logout(&self, id: &SessionId) -> bool {
        let connection = {
            let mut sessions = self.inner.sessions.lock();
            let Some(entry) = sessions.get_mut(id) else {
                return false;
            };
            if entry.logging_out {
                return false;
            }
            entry.logging_out = true;
            entry.cancel_reconnect();
            entry.set_status(SessionStatus::Stopping);
            entry.connection.take()
        };

        if let Some(connection) = connection {
            match connection.logout().await {
                Ok(()) => debug!("protocol logout complete"),
                Err(e) => {
                    if !e.is_unsupported() {
                        warn!(error = %e, "protocol logout failed, closing transport");
                    }
                    if let Err(e) = connection.close().await {
                        debug!(error = %e, "close failed during logout");
                    }
                }
            }
        }

        self.delete_credentials(id).await;
        self.inner.sessions.lock().shift_remove(id);
        self.persist_registry().await;
        info!("session logged out");
        self.emit(SessionEvent::LoggedOut {
            session_id: id.clone(),
        });
        true
    }

    /// Start the session if needed and ask its connection for a pairing code.
    #[instrument(skip(self, phone), fields(session_id = %id))]
    pub async fn request_pairing_code(
        &self,
        id: &SessionId,
        phone: &str,
    ) -> Result<String, SessionError> {
        let connection = self.start(id).await?;
        connection
            .request_pairing_code(phone)
            .await
            .map_err(SessionError::Connection)
    }

    pub fn is_running(&self, id: &SessionId) -> bool {
        self.inner
            .sessions
            .lock()
            .get(id)
            .is_some_and(|entry| entry.connection.is_some())
    }

    pub fn status(&self, id: &SessionId) -> Option<SessionSummary> {
        self.inner.sessions.lock().get(id).map(SessionEntry::summary)
    }

    /// Summaries in registration order.
    pub fn list(&self) -> Vec<SessionSummary> {
        self.inner
            .sessions
            .lock()
            .values()
            .map(SessionEntry::summary)
            .collect()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.sessions.lock().keys().cloned().collect()
    }

    /// Stop every session and refuse further starts. Credentials and the
    /// registry are kept for the next run.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids = self.session_ids();
        let stopped = join_all(ids.iter().map(|id| self.stop(id)))
            .await
            .into_iter()
            .filter(|s| *s)
            .count();
        self.inner.semaphore.close();
        info!(sessions = ids.len(), stopped, "session manager shut down");
    }

    fn live_connection(&self, id: &SessionId) -> Option<Arc<dyn Connection>> {
        self.inner
            .sessions
            .lock()
            .get(id)
            .and_then(|entry| entry.connection.clone())
    }

    fn is_current(&self, id: &SessionId, generation: u64) -> bool {
        self.inner
            .sessions
            .lock()
            .get(id)
            .is_some_and(|entry| entry.is_current(generation))
    }

    fn emit(&self, event: SessionEvent) {
        debug!(session_id = %event.session_id(), event_type = event.event_type(), "session event");
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    async fn persist_registry(&self) {
        let _order = self.inner.persist_lock.lock().await;
        let ids = self.session_ids();
        let registry = self.inner.registry_file.clone();
        match tokio::task::spawn_blocking(move || registry.save(&ids)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                error = %e,
                path = %self.inner.registry_file.path().display(),
                "failed to persist session registry"
            ),
            Err(e) => error!(error = %e, "registry write task failed"),
        }
    }

    async fn save_credentials(&self, id: &SessionId, creds: serde_json::Value) {
        let store = Arc::clone(&self.inner.credentials);
        let owned = id.clone();
        match tokio::task::spawn_blocking(move || store.save(&owned, &creds)).await {
            Ok(Ok(())) => debug!(session_id = %id, "credentials saved"),
            Ok(Err(e)) => warn!(session_id = %id, error = %e, "failed to save credentials"),
            Err(e) => error!(session_id = %id, error = %e, "credential write task failed"),
        }
    }

    async fn delete_credentials(&self, id: &SessionId) {
        let store = Arc::clone(&self.inner.credentials);
        let owned = id.clone();
        match tokio::task::spawn_blocking(move || store.delete(&owned)).await {
            Ok(Ok(existed)) => debug!(session_id = %id, existed, "credentials deleted"),
            Ok(Err(e)) => warn!(session_id = %id, error = %e, "failed to delete credentials"),
            Err(e) => error!(session_id = %id, error = %e, "credential delete task failed"),
        }
    }

    #[instrument(skip(self), fields(session_id = %id, origin = ?origin))]
    async fn start_session(
        &self,
        id: &SessionId,
        origin: StartOrigin,
    ) -> Result<Arc<dyn Connection>, SessionError> {
        let gate = {
            let sessions = self.inner.sessions.lock();
            let entry = sessions
                .get(id)
                .ok_or_else(|| SessionError::NotFound(id.clone()))?;
            if let Some(connection) = &entry.connection {
                return Ok(connection.clone());
            }
            entry.start_gate.clone()
        };
        let gate_guard = gate.lock().await;

        {
            let mut sessions = self.inner.sessions.lock();
            let entry = sessions
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound(id.clone()))?;
            if let Some(connection) = &entry.connection {
                return Ok(connection.clone());
            }
            if entry.logging_out {
                return Err(SessionError::Aborted(id.clone()));
            }
            match origin {
                StartOrigin::Caller => entry.cancel_reconnect(),
                StartOrigin::Reconnect if entry.status != SessionStatus::Reconnecting => {
                    return Err(SessionError::Aborted(id.clone()));
                }
                StartOrigin::Reconnect => {}
            }
            entry.set_status(SessionStatus::Starting);
        }

        let permit = match self.inner.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                self.mark_failed(id, origin);
                return Err(e);
            }
        };
        debug!(active = self.inner.semaphore.active(), "start slot acquired");

        let ConnectionHandle { connection, events } = match self.create_connection(id).await {
            Ok(handle) => handle,
            Err(e) => {
                self.mark_failed(id, origin);
                warn!(error = %e, "session start failed");
                return Err(e);
            }
        };

        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let attached = {
            let mut sessions = self.inner.sessions.lock();
            match sessions.get_mut(id) {
                Some(entry) if entry.status == SessionStatus::Starting && !entry.logging_out => {
                    entry.connection = Some(connection.clone());
                    entry.generation = generation;
                    if origin == StartOrigin::Caller {
                        entry.backoff = self.inner.config.backoff.base;
                    }
                    entry.set_status(SessionStatus::Connected);
                    true
                }
                _ => false,
            }
        };
        if !attached {
            info!("start abandoned, session was stopped or logged out meanwhile");
            if let Err(e) = connection.close().await {
                debug!(error = %e, "close of abandoned connection failed");
            }
            return Err(SessionError::Aborted(id.clone()));
        }

        info!(generation, "session connection created");
        tokio::spawn(self.clone().run_events(id.clone(), generation, events));
        drop(gate_guard);

        let settle = self.inner.config.settle_delay;
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        permit.release();
        Ok(connection)
    }

    async fn create_connection(&self, id: &SessionId) -> Result<ConnectionHandle, SessionError> {
        let create = self.inner.factory.create(id);
        match self.inner.config.start_timeout {
            Some(limit) => tokio::time::timeout(limit, create)
                .await
                .map_err(|_| SessionError::StartTimeout(limit))?
                .map_err(SessionError::Factory),
            None => create.await.map_err(SessionError::Factory),
        }
    }

    fn mark_failed(&self, id: &SessionId, origin: StartOrigin) {
        if let Some(entry) = self.inner.sessions.lock().get_mut(id) {
            if entry.status == SessionStatus::Starting {
                entry.set_status(match origin {
                    StartOrigin::Caller => SessionStatus::Stopped,
                    StartOrigin::Reconnect => SessionStatus::Reconnecting,
                });
            }
        }
    }

    async fn run_events(
        self,
        id: SessionId,
        generation: u64,
        mut events: mpsc::Receiver<ConnectionEvent>,
    ) {
        loop {
            let Some(event) = events.recv().await else {
                if self.is_current(&id, generation) {
                    warn!(session_id = %id, "connection event stream ended without a close");
                    self.handle_close(&id, generation, None).await;
                }
                break;
            };
            if !self.is_current(&id, generation) {
                debug!(session_id = %id, generation, "dropping events of replaced connection");
                break;
            }
            match event {
                ConnectionEvent::CredentialsUpdated(creds) => {
                    self.save_credentials(&id, creds).await;
                }
                ConnectionEvent::Message(payload) => self.emit(SessionEvent::Message {
                    session_id: id.clone(),
                    payload,
                }),
                ConnectionEvent::StateChanged(update) => {
                    if self.handle_update(&id, generation, update).await {
                        break;
                    }
                }
            }
        }
    }

    /// Returns true once the connection has closed.
    async fn handle_update(
        &self,
        id: &SessionId,
        generation: u64,
        update: ConnectionUpdate,
    ) -> bool {
        let state = update.connection;
        let close_reason = update.close_reason.clone();
        let qr = update.qr.clone();

        self.emit(SessionEvent::ConnectionUpdate {
            session_id: id.clone(),
            update,
        });
        if let Some(qr) = qr {
            self.emit(SessionEvent::Qr {
                session_id: id.clone(),
                qr,
            });
        }

        match state {
            Some(ConnectionState::Open) => {
                if let Some(entry) = self.inner.sessions.lock().get_mut(id) {
                    if entry.is_current(generation) {
                        entry.backoff = self.inner.config.backoff.base;
                        entry.set_status(SessionStatus::Connected);
                    }
                }
                info!(session_id = %id, "connection open");
                self.emit(SessionEvent::Connected {
                    session_id: id.clone(),
                });
                false
            }
            Some(ConnectionState::Closed) => {
                self.handle_close(id, generation, close_reason.as_ref()).await;
                true
            }
            _ => false,
        }
    }

    async fn handle_close(&self, id: &SessionId, generation: u64, reason: Option<&CloseReason>) {
        match classify_close(reason) {
            CloseKind::Permanent => self.delete_session(id, generation, reason).await,
            CloseKind::Transient => {
                let reason = reason.map_or_else(|| "unknown".to_string(), ToString::to_string);
                info!(session_id = %id, reason = %reason, "connection closed");
                self.arm_reconnect(id, |entry| entry.is_current(generation));
            }
        }
    }

    async fn delete_session(&self, id: &SessionId, generation: u64, reason: Option<&CloseReason>) {
        {
            let mut sessions = self.inner.sessions.lock();
            if !sessions
                .get(id)
                .is_some_and(|entry| entry.is_current(generation))
            {
                return;
            }
            if let Some(mut entry) = sessions.shift_remove(id) {
                entry.cancel_reconnect();
            }
        }

        let reason = reason.map_or_else(|| "unknown".to_string(), ToString::to_string);
        warn!(session_id = %id, reason = %reason, "credentials rejected, deleting session");
        self.delete_credentials(id).await;
        self.persist_registry().await;
        self.emit(SessionEvent::SessionDeleted {
            session_id: id.clone(),
            reason,
        });
    }

    /// Arm a single reconnect timer if `eligible` holds and none is pending.
    fn arm_reconnect(&self, id: &SessionId, eligible: impl FnOnce(&SessionEntry) -> bool) {
        let (delay, token) = {
            let mut sessions = self.inner.sessions.lock();
            let Some(entry) = sessions.get_mut(id) else {
                return;
            };
            if entry.restarting || entry.logging_out || !eligible(entry) {
                return;
            }
            entry.connection = None;
            entry.restarting = true;
            entry.set_status(SessionStatus::Reconnecting);
            let token = CancellationToken::new();
            entry.reconnect = Some(token.clone());
            (entry.backoff, token)
        };

        info!(
            session_id = %id,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnect scheduled"
        );
        tokio::spawn(self.clone().reconnect_after(id.clone(), delay, token));
    }

    async fn reconnect_after(self, id: SessionId, delay: Duration, token: CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(session_id = %id, "pending reconnect cancelled");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        {
            let mut sessions = self.inner.sessions.lock();
            let Some(entry) = sessions.get_mut(&id) else {
                return;
            };
            if token.is_cancelled() {
                return;
            }
            entry.backoff = self.inner.config.backoff.next(entry.backoff);
            entry.restarting = false;
            entry.reconnect = None;
        }

        match self.start_session(&id, StartOrigin::Reconnect).await {
            Ok(_) => info!(session_id = %id, "session reconnected"),
            Err(
                e @ (SessionError::NotFound(_)
                | SessionError::Aborted(_)
                | SessionError::ShuttingDown),
            ) => debug!(session_id = %id, error = %e, "reconnect dropped"),
            Err(e) => {
                warn!(session_id = %id, error = %e, "reconnect failed, retrying");
                self.arm_reconnect(&id, |entry| {
                    entry.status == SessionStatus::Reconnecting && entry.connection.is_none()
                });
            }
        }
    }
}
