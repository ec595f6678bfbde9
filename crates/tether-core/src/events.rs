use serde::{Deserialize, Serialize};

use crate::connection::ConnectionUpdate;
use crate::ids::SessionId;

/// Notifications published by the session manager for the dispatch and HTTP layers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Qr {
        session_id: SessionId,
        qr: String,
    },

    Connected {
        session_id: SessionId,
    },

    /// Credentials were rejected; the session is gone and will not reconnect.
    SessionDeleted {
        session_id: SessionId,
        reason: String,
    },

    LoggedOut {
        session_id: SessionId,
    },

    /// Diagnostic passthrough of every connection update.
    ConnectionUpdate {
        session_id: SessionId,
        update: ConnectionUpdate,
    },

    Message {
        session_id: SessionId,
        payload: serde_json::Value,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Qr { session_id, .. }
            | Self::Connected { session_id }
            | Self::SessionDeleted { session_id, .. }
            | Self::LoggedOut { session_id }
            | Self::ConnectionUpdate { session_id, .. }
            | Self::Message { session_id, .. } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Qr { .. } => "qr",
            Self::Connected { .. } => "connected",
            Self::SessionDeleted { .. } => "session_deleted",
            Self::LoggedOut { .. } => "logged_out",
            Self::ConnectionUpdate { .. } => "connection_update",
            Self::Message { .. } => "message",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        SessionId::parse("15550001").unwrap()
    }

    #[test]
    fn tagged_serialization() {
        let event = SessionEvent::SessionDeleted {
            session_id: sid(),
            reason: "status 401".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session_deleted");
        assert_eq!(json["session_id"], "15550001");
        assert_eq!(json["reason"], "status 401");
    }

    #[test]
    fn event_type_matches_serde_tag() {
        let events = vec![
            SessionEvent::Qr { session_id: sid(), qr: "2@abc".into() },
            SessionEvent::Connected { session_id: sid() },
            SessionEvent::LoggedOut { session_id: sid() },
            SessionEvent::Message { session_id: sid(), payload: serde_json::json!({"k": 1}) },
        ];
        for event in &events {
            let json = serde_json::to_value(event).unwrap();
            assert_eq!(json["type"], event.event_type());
            assert_eq!(event.session_id(), &sid());
        }
    }
}
