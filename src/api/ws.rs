//! WebSocket push channel
//!
//! Streams every appended event to connected dashboards and node
//! listeners. Subscribers receive only events appended after they
//! connect; a receiver that falls behind the broadcast buffer skips the
//! missed events instead of blocking producers.
//!
//! Incoming text frames carry node messages, currently heartbeats and
//! event acknowledgements.

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::coordinator::Coordinator;

/// Message a node sends over its socket
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Heartbeat { node_id: String },
    Ack { event_id: String },
}

/// Upgrade handler for `/ws`
pub async fn handle_ws(
    State(coordinator): State<Arc<Coordinator>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_socket(socket, coordinator))
}

async fn run_socket(socket: WebSocket, coordinator: Arc<Coordinator>) {
    let (mut sink, mut stream) = socket.split();
    let mut events = coordinator.subscribe_events();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let frame = match serde_json::to_string(&event) {
                        Ok(frame) => frame,
                        Err(error) => {
                            tracing::error!("event serialization failed: {}", error);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("websocket subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_client_message(&coordinator, &text).await;
                }
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
}

async fn handle_client_message(coordinator: &Coordinator, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Heartbeat { node_id }) => {
            if let Err(error) = coordinator.heartbeat(&node_id).await {
                tracing::debug!("heartbeat from unknown node {}: {}", node_id, error);
            }
        }
        Ok(ClientMessage::Ack { event_id }) => {
            if let Err(error) = coordinator.mark_event_processed(&event_id).await {
                tracing::debug!("ack for unknown event {}: {}", event_id, error);
            }
        }
        Err(_) => {
            tracing::debug!("unrecognized websocket message: {}", text);
        }
    }
}
