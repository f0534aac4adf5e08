//! The `/ws` live channel.
//!
//! Each connection gets a bus subscription with a bounded queue; client
//! messages adjust the filter, heartbeats flow on the configured
//! interval, and a saturated queue closes the connection with reason
//! `slow_consumer`.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::bus::{BusMessage, DisconnectReason, SubscriptionFilter};

use super::state::AppState;

/// 1013 "try again later": subscriber cap reached.
const CLOSE_OVERLOADED: u16 = 1013;
/// 1011 "internal error": server-initiated disconnect.
const CLOSE_SERVER: u16 = 1011;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Subscribe {
        #[serde(default)]
        filters: SubscriptionFilter,
    },
    Ping,
    Unsubscribe,
}

/// GET /ws
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// GET /ws/connections
pub async fn connection_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "active_connections": state.bus.subscriber_count(),
        "metrics": state.metrics.snapshot(),
        "timestamp": Utc::now(),
    }))
}

async fn send_json(socket: &mut WebSocket, message: &BusMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(_) => false,
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let Some(mut subscription) = state.bus.subscribe(SubscriptionFilter::default()) else {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_OVERLOADED,
                reason: "connection limit reached".into(),
            })))
            .await;
        return;
    };
    let id = subscription.id;
    debug!(subscriber = %id, "websocket connected");

    let connected = BusMessage::new(
        "connected",
        Some(json!({ "client_id": id.to_string() })),
    );
    if !send_json(&mut socket, &connected).await {
        state.bus.unsubscribe(id, DisconnectReason::ClientClosed);
        return;
    }

    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(state.config.ws.heartbeat_interval_s.max(1)));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // immediate first tick

    loop {
        tokio::select! {
            published = subscription.receiver.recv() => {
                match published {
                    // The bus is closing the process down.
                    Some(message) if message.kind == "shutdown" => {
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_SERVER,
                                reason: "shutdown".into(),
                            })))
                            .await;
                        return;
                    }
                    Some(message) => {
                        if !send_json(&mut socket, &message).await {
                            break;
                        }
                    }
                    // The bus dropped us: queue saturated.
                    None => {
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_SERVER,
                                reason: "slow_consumer".into(),
                            })))
                            .await;
                        return;
                    }
                }
            }
            _ = heartbeat.tick() => {
                let beat = BusMessage::new(
                    "heartbeat",
                    Some(json!({ "active_connections": state.bus.subscriber_count() })),
                );
                if !send_json(&mut socket, &beat).await {
                    break;
                }
                let stats = BusMessage::new(
                    "stats",
                    serde_json::to_value(state.metrics.snapshot()).ok(),
                );
                if !send_json(&mut socket, &stats).await {
                    break;
                }
            }
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else {
                    break;
                };
                match message {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(ClientMessage::Subscribe { filters }) => {
                                state.bus.update_filter(id, filters.clone());
                                let ack = BusMessage::new(
                                    "subscribed",
                                    serde_json::to_value(&filters).ok(),
                                );
                                if !send_json(&mut socket, &ack).await {
                                    break;
                                }
                            }
                            Ok(ClientMessage::Ping) => {
                                let pong = BusMessage::new("pong", None);
                                if !send_json(&mut socket, &pong).await {
                                    break;
                                }
                            }
                            Ok(ClientMessage::Unsubscribe) => {
                                state.bus.update_filter(id, SubscriptionFilter::default());
                                let ack = BusMessage::new("unsubscribed", None);
                                if !send_json(&mut socket, &ack).await {
                                    break;
                                }
                            }
                            Err(e) => {
                                let error = BusMessage::new(
                                    "error",
                                    Some(json!({ "message": format!("invalid message: {e}") })),
                                );
                                if !send_json(&mut socket, &error).await {
                                    break;
                                }
                            }
                        }
                    }
                    Message::Close(_) => break,
                    // Transport pings are answered by axum itself.
                    _ => {}
                }
            }
        }
    }

    state.bus.unsubscribe(id, DisconnectReason::ClientClosed);
    debug!(subscriber = %id, "websocket closed");
}
