//! In-process connections with no network behind them.
//!
//! Used by the binary when no protocol client is linked and by tests, which
//! script factory outcomes per session and inject lifecycle events by hand.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_core::{
    CloseReason, Connection, ConnectionError, ConnectionEvent, ConnectionFactory,
    ConnectionHandle, ConnectionState, ConnectionUpdate, SessionId,
};
use tokio::sync::mpsc;

const EVENT_BUFFER: usize = 64;

/// Pre-programmed result of one `create` call.
#[derive(Debug)]
pub enum LoopbackOutcome {
    Connect,
    Fail(ConnectionError),
    /// Wait, then resolve the inner outcome.
    Delay(Duration, Box<LoopbackOutcome>),
    /// Never resolve.
    Hang,
}

impl LoopbackOutcome {
    pub fn delayed(delay: Duration, inner: LoopbackOutcome) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

pub struct LoopbackFactory {
    scripts: Mutex<HashMap<SessionId, VecDeque<LoopbackOutcome>>>,
    connections: Mutex<HashMap<SessionId, Vec<Weak<LoopbackConnection>>>>,
    calls: Mutex<HashMap<SessionId, usize>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    auto_open: bool,
    supports_logout: bool,
    logout_delay: Duration,
}

impl Default for LoopbackFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFactory {
    /// Connections report `open` as soon as they are created.
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
            auto_open: true,
            supports_logout: true,
            logout_delay: Duration::ZERO,
        }
    }

    pub fn with_auto_open(mut self, auto_open: bool) -> Self {
        self.auto_open = auto_open;
        self
    }

    /// Created connections only support a hard close.
    pub fn without_logout(mut self) -> Self {
        self.supports_logout = false;
        self
    }

    /// Created connections wait `delay` before completing a protocol logout.
    pub fn with_logout_delay(mut self, delay: Duration) -> Self {
        self.logout_delay = delay;
        self
    }

    /// Queue an outcome for the next unscripted `create` of `id`.
    pub fn script(&self, id: &SessionId, outcome: LoopbackOutcome) {
        self.scripts
            .lock()
            .entry(id.clone())
            .or_default()
            .push_back(outcome);
    }

    pub fn create_calls(&self, id: &SessionId) -> usize {
        self.calls.lock().get(id).copied().unwrap_or(0)
    }

    pub fn total_creates(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// Connections closed or logged out so far, including dropped ones.
    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Highest number of `create` calls that were in progress at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Most recent connection for `id` that is still alive.
    pub fn latest(&self, id: &SessionId) -> Option<Arc<LoopbackConnection>> {
        self.connections
            .lock()
            .get(id)
            .and_then(|list| list.last())
            .and_then(Weak::upgrade)
    }

    fn next_outcome(&self, id: &SessionId) -> LoopbackOutcome {
        self.scripts
            .lock()
            .get_mut(id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(LoopbackOutcome::Connect)
    }

    fn connect(&self, id: &SessionId) -> ConnectionHandle {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        if self.auto_open {
            let _ = tx.try_send(ConnectionEvent::StateChanged(ConnectionUpdate::state(
                ConnectionState::Open,
            )));
        }
        let connection = Arc::new(LoopbackConnection {
            id: id.clone(),
            events: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            logged_out: AtomicBool::new(false),
            supports_logout: self.supports_logout,
            logout_delay: self.logout_delay,
            closed_total: self.closed.clone(),
        });
        let mut connections = self.connections.lock();
        let list = connections.entry(id.clone()).or_default();
        list.retain(|weak| weak.strong_count() > 0);
        list.push(Arc::downgrade(&connection));

        ConnectionHandle {
            connection,
            events: rx,
        }
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionFactory for LoopbackFactory {
    async fn create(&self, session_id: &SessionId) -> Result<ConnectionHandle, ConnectionError> {
        *self.calls.lock().entry(session_id.clone()).or_default() += 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(self.in_flight.clone());

        let mut outcome = self.next_outcome(session_id);
        loop {
            match outcome {
                LoopbackOutcome::Connect => return Ok(self.connect(session_id)),
                LoopbackOutcome::Fail(e) => return Err(e),
                LoopbackOutcome::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    outcome = *inner;
                }
                LoopbackOutcome::Hang => std::future::pending::<()>().await,
            }
        }
    }
}

/// A connection whose lifecycle events are injected by the caller.
pub struct LoopbackConnection {
    id: SessionId,
    events: Mutex<Option<mpsc::Sender<ConnectionEvent>>>,
    closed: AtomicBool,
    logged_out: AtomicBool,
    supports_logout: bool,
    logout_delay: Duration,
    closed_total: Arc<AtomicUsize>,
}

impl LoopbackConnection {
    pub fn session_id(&self) -> &SessionId {
        &self.id
    }

    /// Deliver an event. Returns false once the stream has ended.
    pub async fn emit(&self, event: ConnectionEvent) -> bool {
        let tx = self.events.lock().clone();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    pub async fn open(&self) -> bool {
        self.emit(ConnectionEvent::StateChanged(ConnectionUpdate::state(
            ConnectionState::Open,
        )))
        .await
    }

    pub async fn close_with(&self, reason: CloseReason) -> bool {
        self.emit(ConnectionEvent::StateChanged(ConnectionUpdate::closed(reason)))
            .await
    }

    pub async fn show_qr(&self, payload: &str) -> bool {
        self.emit(ConnectionEvent::StateChanged(ConnectionUpdate::qr(payload)))
            .await
    }

    /// End the event stream without a close update.
    pub fn hang_up(&self) {
        self.events.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    /// Report the close the way a real transport would, then end the stream.
    fn finish(&self, reason: CloseReason) {
        self.closed_total.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.events.lock().take() {
            let _ = tx.try_send(ConnectionEvent::StateChanged(ConnectionUpdate::closed(reason)));
        }
    }
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn close(&self) -> Result<(), ConnectionError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.finish(CloseReason {
                status_code: Some(428),
                reason: None,
                message: Some("Connection Closed".into()),
            });
        }
        Ok(())
    }

    async fn logout(&self) -> Result<(), ConnectionError> {
        if !self.supports_logout {
            return Err(ConnectionError::Unsupported("logout"));
        }
        if !self.logout_delay.is_zero() {
            tokio::time::sleep(self.logout_delay).await;
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        self.logged_out.store(true, Ordering::SeqCst);
        self.finish(CloseReason {
            status_code: Some(401),
            reason: Some("loggedOut".into()),
            message: None,
        });
        Ok(())
    }

    async fn request_pairing_code(&self, phone: &str) -> Result<String, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
        if digits.len() < 6 {
            return Err(ConnectionError::Other(format!("invalid phone number: {phone}")));
        }
        let tail = &digits[digits.len() - 6..];
        Ok(format!("LB{tail}"))
    }
}
