use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_core::{Connection, SessionId};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Stopped,
    Starting,
    Connected,
    Reconnecting,
    Stopping,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Stopping => "stopping",
        }
    }
}

/// Registry record for one session.
pub(crate) struct SessionEntry {
    pub id: SessionId,
    pub connection: Option<Arc<dyn Connection>>,
    pub status: SessionStatus,
    /// Delay before the next reconnect.
    pub backoff: Duration,
    /// A reconnect is armed and has not fired yet.
    pub restarting: bool,
    /// Identifies the connection whose events are currently honoured.
    pub generation: u64,
    pub reconnect: Option<CancellationToken>,
    pub logging_out: bool,
    /// Serializes starts of this session.
    pub start_gate: Arc<tokio::sync::Mutex<()>>,
    pub updated_at: DateTime<Utc>,
}

impl SessionEntry {
    pub fn new(id: SessionId, backoff: Duration) -> Self {
        Self {
            id,
            connection: None,
            status: SessionStatus::Stopped,
            backoff,
            restarting: false,
            generation: 0,
            reconnect: None,
            logging_out: false,
            start_gate: Arc::new(tokio::sync::Mutex::new(())),
            updated_at: Utc::now(),
        }
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.connection.is_some()
    }

    pub fn cancel_reconnect(&mut self) {
        if let Some(token) = self.reconnect.take() {
            token.cancel();
        }
        self.restarting = false;
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            status: self.status,
            running: self.connection.is_some(),
            backoff_ms: u64::try_from(self.backoff.as_millis()).unwrap_or(u64::MAX),
            updated_at: self.updated_at,
        }
    }
}

/// Point-in-time view of a session for listings.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub status: SessionStatus,
    pub running: bool,
    pub backoff_ms: u64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entry_is_stopped() {
        let entry = SessionEntry::new(SessionId::parse("1").unwrap(), Duration::from_secs(2));
        let summary = entry.summary();
        assert_eq!(summary.status, SessionStatus::Stopped);
        assert!(!summary.running);
        assert_eq!(summary.backoff_ms, 2000);
        assert!(!entry.is_current(0));
    }

    #[test]
    fn cancel_reconnect_fires_token() {
        let mut entry = SessionEntry::new(SessionId::parse("1").unwrap(), Duration::from_secs(2));
        let token = CancellationToken::new();
        entry.reconnect = Some(token.clone());
        entry.restarting = true;
        entry.cancel_reconnect();
        assert!(token.is_cancelled());
        assert!(!entry.restarting);
        assert!(entry.reconnect.is_none());
    }

    #[test]
    fn summary_serializes_camel_case() {
        let entry = SessionEntry::new(SessionId::parse("77").unwrap(), Duration::from_millis(250));
        let json = serde_json::to_value(entry.summary()).unwrap();
        assert_eq!(json["id"], "77");
        assert_eq!(json["status"], "stopped");
        assert_eq!(json["backoffMs"], 250);
        assert!(json.get("updatedAt").is_some());
    }
}
