// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Control-plane WebSocket: decodes inbound messages, hands them to the
//! gateway, and writes the gateway's notifications back out.

use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    Extension,
};
use futures::{SinkExt, StreamExt};
use mcpgate_core::{decode_control_message, ServerMessage};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::{api::AppState, auth::AuthContext};

/// `GET /ws`
pub async fn ws_control(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> impl IntoResponse {
    info!("Control-plane socket requested by user {}", auth.user_id);
    ws.on_upgrade(move |socket| handle_control_socket(socket, state, auth))
}

async fn handle_control_socket(socket: WebSocket, state: AppState, auth: AuthContext) {
    let (mut sender, mut receiver) = socket.split();

    let (handle, mut outbound) = match state.gateway.open_socket(auth.user_id.clone()).await {
        Ok(registered) => registered,
        Err(err) => {
            error!("Cannot register control-plane socket: {}", err);
            if let Some(reply) = encode(&ServerMessage::Error {
                error: err.to_string(),
            }) {
                let _ = sender.send(Message::Text(reply)).await;
            }
            return;
        }
    };

    let heartbeat = &state.config.heartbeat;
    let pong_timeout = Duration::from_secs(heartbeat.pong_timeout_secs);
    let mut ping_interval = interval(Duration::from_secs(heartbeat.ping_interval_secs.max(1)));
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > pong_timeout {
                    warn!("Control-plane socket unresponsive for user {}, closing", auth.user_id);
                    break;
                }
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
            }

            next = receiver.next() => {
                match next {
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Control-plane socket closed by user {}", auth.user_id);
                        break;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sender.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Text(text))) => {
                        match decode_control_message(&text) {
                            Ok(message) => {
                                debug!("Control message {} from user {}", message.kind(), auth.user_id);
                                if let Err(err) = state.gateway.dispatch(&handle, message).await {
                                    error!("Gateway rejected control message: {}", err);
                                    break;
                                }
                            }
                            Err(violation) => {
                                debug!("Rejected control message from user {}: {}", auth.user_id, violation.reason);
                                let Some(reply) = encode(&violation.into_reply()) else {
                                    continue;
                                };
                                if sender.send(Message::Text(reply)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let Some(reply) = encode(&ServerMessage::Error {
                            error: "Binary frames are not supported".to_string(),
                        }) else {
                            continue;
                        };
                        if sender.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        warn!("Control-plane receive error: {}", err);
                        break;
                    }
                }
            }

            notification = outbound.recv() => {
                let Some(notification) = notification else {
                    break;
                };
                let Some(text) = encode(&notification) else {
                    continue;
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    info!("Control-plane socket for user {} went away", auth.user_id);
                    break;
                }
            }
        }
    }

    if let Err(err) = state.gateway.close_socket(handle).await {
        debug!("Socket close not delivered: {}", err);
    }
}

/// Serialises a notification; failures are logged and the message dropped.
fn encode(message: &ServerMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(text) => Some(text),
        Err(err) => {
            error!("Failed to serialise notification: {}", err);
            None
        }
    }
}
