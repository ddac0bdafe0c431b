//! One UI WebSocket session.
//!
//! Inbound messages manage stats subscriptions; outbound traffic is the
//! session's event-bus channel, written in order by a dedicated task. When
//! the socket dies everything the session held is released.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::events::EventBus;
use crate::subscriptions::SubscriptionManager;

#[derive(Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
    payload: Option<SubscriptionPayload>,
}

#[derive(Deserialize)]
struct SubscriptionPayload {
    #[serde(rename = "hostId")]
    host_id: String,
    #[serde(rename = "vmName")]
    vm_name: String,
}

pub async fn run(socket: WebSocket, bus: Arc<EventBus>, subscriptions: Arc<SubscriptionManager>) {
    let (mut sink, mut stream) = socket.split();
    let (client_id, mut outbound) = bus.register();

    // Outbound events are written in order; an error on either direction
    // ends the whole session.
    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if sink.send(Message::Text(message.into())).await.is_err() {
                break;
            }
        }
    });

    let reader = async {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => {
                    let parsed: ClientMessage = match serde_json::from_str(&text) {
                        Ok(parsed) => parsed,
                        Err(error) => {
                            debug!(client = client_id, %error, "ignoring malformed client message");
                            continue;
                        }
                    };

                    match (parsed.kind.as_str(), parsed.payload) {
                        ("subscribe-vm-stats", Some(payload)) => {
                            subscriptions.subscribe(client_id, &payload.host_id, &payload.vm_name);
                        }
                        ("unsubscribe-vm-stats", Some(payload)) => {
                            subscriptions.unsubscribe(
                                client_id,
                                &payload.host_id,
                                &payload.vm_name,
                            );
                        }
                        (kind, _) => {
                            warn!(client = client_id, kind, "unknown client message type");
                        }
                    }
                }
                Message::Close(_) => break,
                // Ping/pong are handled by the websocket layer.
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = &mut writer => {}
        _ = reader => {}
    }

    bus.unregister(client_id);
    subscriptions.unsubscribe_all(client_id);
    writer.abort();
    debug!(client = client_id, "UI session closed");
}
