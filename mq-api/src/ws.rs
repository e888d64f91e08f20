//! WebSocket push channel: one socket per session.
//!
//! The server pushes `coin_collected`, `mission_ready`, `level_up`,
//! `vip_tier_up`, `notification` and `empire_income_ready`. Clients
//! send `ping` and optional `location_update`, which is forwarded to
//! the world-map subsystem and has no effect here.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;

use mq_auth::AuthSubject;
use mq_engine::PushMessage;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Access token; WebSocket clients cannot set headers reliably.
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    LocationUpdate { x: f64, y: f64 },
}

/// GET /ws?token=... — upgrade and attach to the notification hub.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let subject = state.gate.verify(&query.token).await?;
    Ok(upgrade.on_upgrade(move |socket| session_loop(state, subject, socket)))
}

async fn session_loop(state: Arc<AppState>, subject: AuthSubject, socket: WebSocket) {
    let mut updates = state
        .hub
        .subscribe(&subject.tenant_id, &subject.user_id)
        .await;
    let (mut sink, mut stream) = socket.split();

    tracing::debug!(user_id = %subject.user_id, "websocket session attached");
    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(message) => {
                        let Ok(text) = serde_json::to_string(&message) else {
                            continue;
                        };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // Lagged receivers just skip what they missed.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "websocket receiver lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Ping) => {
                                let Ok(pong) = serde_json::to_string(&PushMessage::Pong) else {
                                    continue;
                                };
                                if sink.send(Message::Text(pong)).await.is_err() {
                                    break;
                                }
                            }
                            Ok(ClientMessage::LocationUpdate { x, y }) => {
                                // Out of scope here; the world-map
                                // subsystem consumes these.
                                tracing::trace!(user_id = %subject.user_id, x, y, "location update");
                            }
                            Err(err) => {
                                tracing::debug!(error = %err, "unparseable client message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!(user_id = %subject.user_id, "websocket session detached");
}
