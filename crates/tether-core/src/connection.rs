//! Boundary to the wrapped messaging-protocol client.
//!
//! A [`ConnectionFactory`] turns a session id into a live [`Connection`] plus
//! the receiving end of its lifecycle event channel. The session manager owns
//! one task per connection that drains that channel in order.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::ConnectionError;
use crate::ids::SessionId;

/// Transport state reported by a connection update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Why a connection closed, as reported by the protocol client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseReason {
    /// Protocol status code (401 means the device was logged out).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Machine-readable reason from the close payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable error message, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CloseReason {
    pub fn status(code: u16) -> Self {
        Self {
            status_code: Some(code),
            ..Self::default()
        }
    }

    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(code) = self.status_code {
            parts.push(format!("status {code}"));
        }
        if let Some(reason) = &self.reason {
            parts.push(reason.clone());
        }
        if let Some(message) = &self.message {
            parts.push(message.clone());
        }
        if parts.is_empty() {
            f.write_str("unknown")
        } else {
            f.write_str(&parts.join(": "))
        }
    }
}

/// One `connectionStateChanged` notification.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<CloseReason>,
    /// QR payload to present for pairing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
}

impl ConnectionUpdate {
    pub fn state(state: ConnectionState) -> Self {
        Self {
            connection: Some(state),
            ..Self::default()
        }
    }

    pub fn closed(reason: CloseReason) -> Self {
        Self {
            connection: Some(ConnectionState::Closed),
            close_reason: Some(reason),
            qr: None,
        }
    }

    pub fn qr(payload: impl Into<String>) -> Self {
        Self {
            qr: Some(payload.into()),
            ..Self::default()
        }
    }
}

/// Lifecycle events emitted by a connection.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    /// Credentials changed and should be persisted.
    CredentialsUpdated(serde_json::Value),
    StateChanged(ConnectionUpdate),
    /// Raw incoming message, passed through unparsed.
    Message(serde_json::Value),
}

/// A live protocol connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Hard-close the underlying transport.
    async fn close(&self) -> Result<(), ConnectionError>;

    /// Protocol-level logout. Connections that cannot log out gracefully
    /// keep the default, and callers fall back to [`Connection::close`].
    async fn logout(&self) -> Result<(), ConnectionError> {
        Err(ConnectionError::Unsupported("logout"))
    }

    /// Request a phone-number pairing code instead of a QR scan.
    async fn request_pairing_code(&self, _phone: &str) -> Result<String, ConnectionError> {
        Err(ConnectionError::Unsupported("pairing code"))
    }
}

/// A freshly created connection and its event stream.
pub struct ConnectionHandle {
    pub connection: Arc<dyn Connection>,
    pub events: mpsc::Receiver<ConnectionEvent>,
}

/// Builds connections bound to a session's persisted credentials.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self, session_id: &SessionId) -> Result<ConnectionHandle, ConnectionError>;
}
