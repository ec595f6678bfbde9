//! Forwards the manager's [`SessionEvent`] broadcast to WebSocket clients.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tether_core::{SessionEvent, SessionId};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::server::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Only forward events of this session.
    pub session: Option<SessionId>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let rx = state.manager.subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, rx, query.session))
}

/// Serialize an event for the wire, honouring an optional session filter.
pub fn encode_event(event: &SessionEvent, filter: Option<&SessionId>) -> Option<String> {
    if filter.is_some_and(|id| id != event.session_id()) {
        return None;
    }
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize session event");
            None
        }
    }
}

async fn forward_events(
    socket: WebSocket,
    rx: broadcast::Receiver<SessionEvent>,
    filter: Option<SessionId>,
) {
    let (mut sink, mut incoming) = socket.split();
    let mut events = BroadcastStream::new(rx);
    tracing::info!(filter = ?filter, "event stream client connected");

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(event)) => {
                    let Some(json) = encode_event(&event, filter.as_ref()) else {
                        continue;
                    };
                    if sink.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "event stream client lagged, dropped events");
                }
                None => break,
            },
            msg = incoming.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sink.close().await;
    tracing::info!("event stream client disconnected");
}
