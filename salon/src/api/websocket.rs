//! Live updates over WebSocket.
//!
//! # Protocol
//!
//! Connect to `GET /ws` with the gateway identity headers. Then:
//!
//! **Client → Server:**
//! ```json
//! {"type": "subscribe", "topic": "salon:550e8400-..."}
//! {"type": "unsubscribe", "topic": "user:660e8400-..."}
//! {"type": "ping"}
//! ```
//!
//! **Server → Client:**
//! ```json
//! {"type": "snapshot", "topic": "salon:...", "snapshot": {"kind": "salon", ...}}
//! {"type": "subscribed", "topic": "salon:..."}
//! {"type": "event", "topic": "user:...", "event": {"type": "delay_alert", ...}}
//! {"type": "unsubscribed", "topic": "..."}
//! {"type": "error", "code": "FORBIDDEN", "message": "..."}
//! {"type": "pong"}
//! ```
//!
//! The snapshot for a topic always arrives before its `subscribed`
//! acknowledgement and before any event published on it afterwards.

use crate::api::principal::Caller;
use crate::app::QueueService;
use crate::distribution::{ConnectionId, Delivery, OutboundEvent, Snapshot, Topic};
use crate::error::QueueError;
use crate::server::state::AppState;
use crate::types::Principal;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Message from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving a topic
    Subscribe {
        /// `salon:{id}` or `user:{id}`
        topic: String,
    },
    /// Stop receiving a topic
    Unsubscribe {
        /// `salon:{id}` or `user:{id}`
        topic: String,
    },
    /// Keep-alive
    Ping,
}

/// Message from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Subscription registered
    Subscribed {
        /// Topic
        topic: Topic,
    },
    /// Subscription removed
    Unsubscribed {
        /// Topic
        topic: Topic,
    },
    /// Current state of a topic
    Snapshot {
        /// Topic
        topic: Topic,
        /// State
        snapshot: Snapshot,
    },
    /// Event published on a topic
    Event {
        /// Topic
        topic: Topic,
        /// Event
        event: OutboundEvent,
    },
    /// A client message was refused
    Error {
        /// Stable error code
        code: String,
        /// Description
        message: String,
    },
    /// Keep-alive answer
    Pong,
}

impl ServerMessage {
    fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<Delivery> for ServerMessage {
    fn from(delivery: Delivery) -> Self {
        match delivery {
            Delivery::Snapshot { topic, snapshot } => Self::Snapshot { topic, snapshot },
            Delivery::Event { topic, event } => Self::Event { topic, event },
        }
    }
}

impl From<QueueError> for ServerMessage {
    fn from(err: QueueError) -> Self {
        Self::error(err.code(), err.to_string())
    }
}

/// Upgrade to a WebSocket connection
#[allow(clippy::unused_async)] // Axum handler signature requires async
pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>, caller: Caller) -> Response {
    let service = Arc::clone(&state.service);
    ws.on_upgrade(move |socket| handle_socket(socket, service, caller.0))
}

/// Replies a connection may have queued before its reader waits
const REPLY_BUFFER: usize = 32;

async fn handle_socket(socket: WebSocket, service: Arc<QueueService>, principal: Principal) {
    let (id, mut deliveries) = service.connect(principal);
    tracing::info!(connection = %id, ?principal, "WebSocket connected");

    let (mut sink, mut stream) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerMessage>(REPLY_BUFFER);

    let mut send_task = tokio::spawn(async move {
        loop {
            // Deliveries first: a snapshot is queued before its acknowledgement
            let message = tokio::select! {
                biased;
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => ServerMessage::from(delivery),
                    // Pruned by the hub; closing makes the client resubscribe
                    None => break,
                },
                Some(reply) = reply_rx.recv() => reply,
                else => break,
            };

            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(error) => {
                    tracing::error!(%error, "Failed to encode server message");
                    continue;
                },
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let recv_service = Arc::clone(&service);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => {
                    let reply = handle_client_message(&recv_service, id, &text).await;
                    if reply_tx.send(reply).await.is_err() {
                        break;
                    }
                },
                Message::Close(_) => break,
                _ => {},
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    service.disconnect(id);
    tracing::info!(connection = %id, "WebSocket disconnected");
}

/// Apply one client message and produce the reply
pub async fn handle_client_message(service: &QueueService, id: ConnectionId, text: &str) -> ServerMessage {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(error) => return ServerMessage::error("BAD_MESSAGE", error.to_string()),
    };

    match message {
        ClientMessage::Ping => ServerMessage::Pong,
        ClientMessage::Subscribe { topic } => {
            let topic = match topic.parse::<Topic>() {
                Ok(topic) => topic,
                Err(error) => return QueueError::from(error).into(),
            };
            match service.subscribe(id, topic).await {
                Ok(()) => ServerMessage::Subscribed { topic },
                Err(error) => error.into(),
            }
        },
        ClientMessage::Unsubscribe { topic } => match topic.parse::<Topic>() {
            Ok(topic) => {
                service.unsubscribe(id, topic);
                ServerMessage::Unsubscribed { topic }
            },
            Err(error) => QueueError::from(error).into(),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;
    use crate::types::UserId;

    #[test]
    fn client_messages_parse() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","topic":"salon:abc"}"#).unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Subscribe {
                topic: "salon:abc".to_string()
            }
        );

        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, ClientMessage::Ping);
    }

    #[test]
    fn server_messages_are_tagged() {
        let topic = Topic::User(UserId::new());
        let json = serde_json::to_value(ServerMessage::Subscribed { topic }).unwrap();
        assert_eq!(json["type"], "subscribed");
        assert_eq!(json["topic"], topic.to_string());

        let json = serde_json::to_value(ServerMessage::error("FORBIDDEN", "no")).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "FORBIDDEN");
    }
}
