//! WebSocket event streaming for observers.
//!
//! One server→client JSON stream per session. The server pings every 30
//! seconds; a client disconnect cancels the session (disconnect ⇒ cancel,
//! so an unwatched deliberation never runs to completion on its own).

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use uuid::Uuid;

use crate::runtime::Subscription;
use crate::AppState;

/// Ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Streaming routes.
pub fn router() -> Router<AppState> {
    Router::new().route("/ws/sessions/{id}", get(websocket_session_events))
}

/// Upgrade to a per-session event stream.
pub async fn websocket_session_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if state.sessions.get(id).is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(state, id, socket))
}

async fn handle_socket(state: AppState, id: Uuid, socket: WebSocket) {
    let Some(subscription) = state.sessions.broadcaster().subscribe(id) else {
        // Session reached terminal state and was torn down before the
        // upgrade completed.
        return;
    };

    tracing::debug!(session_id = %id, "observer connected");
    let disconnected = stream_events(&state, id, socket, &subscription).await;
    state.sessions.broadcaster().unsubscribe(&subscription);

    if disconnected {
        // Disconnect ⇒ cancel; a no-op when the session already ended.
        let _ = state.sessions.cancel(id);
        tracing::debug!(session_id = %id, "observer disconnected; session cancel requested");
    }
}

/// Pump events until the stream ends or the client goes away. Returns
/// whether the client disconnected while the session was still live.
async fn stream_events(
    _state: &AppState,
    id: Uuid,
    socket: WebSocket,
    subscription: &Subscription,
) -> bool {
    let (mut sender, mut receiver) = socket.split();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = subscription.recv() => match event {
                Some(envelope) => {
                    let json = match serde_json::to_string(&envelope) {
                        Ok(json) => json,
                        Err(err) => {
                            tracing::error!(session_id = %id, error = %err, "event serialization failed");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        return true;
                    }
                }
                None => {
                    // Session stream ended; close politely.
                    let _ = sender.send(Message::Close(None)).await;
                    return false;
                }
            },
            _ = ping.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return true;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => return true,
                Some(Ok(_)) => {}
                Some(Err(_)) => return true,
            }
        }
    }
}
