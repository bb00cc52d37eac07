//! A simulated hub whose devices obey service calls.
//!
//! `turn_on` / `turn_off` are acknowledged and then reported back as a
//! `state_changed` event carrying the service data as attributes. Entities
//! named `*.stuck` accept commands but never change; the `explode` service
//! is rejected. Every new subscription first receives a `sensor.boot`
//! event.
#![allow(dead_code, clippy::unwrap_used)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

pub const TOKEN: &str = "sim-token";
pub const HUB_VERSION: &str = "2026.10.0";

pub struct SimHub {
    pub url: String,
}

impl SimHub {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream));
            }
        });
        Self {
            url: format!("ws://{addr}/api/websocket"),
        }
    }
}

async fn serve(stream: TcpStream) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    if send(&mut ws, json!({ "type": "auth_required", "ha_version": HUB_VERSION })).await.is_err() {
        return;
    }
    let Some(auth) = next_json(&mut ws).await else {
        return;
    };
    if auth["access_token"] != TOKEN {
        let _ = send(&mut ws, json!({ "type": "auth_invalid", "message": "Invalid access token" })).await;
        return;
    }
    if send(&mut ws, json!({ "type": "auth_ok", "ha_version": HUB_VERSION })).await.is_err() {
        return;
    }

    let mut subscriptions: Vec<u64> = Vec::new();
    while let Some(frame) = next_json(&mut ws).await {
        let id = frame["id"].as_u64().unwrap_or_default();
        let mut replies = Vec::new();
        match frame["type"].as_str().unwrap_or_default() {
            "ping" => replies.push(json!({ "id": id, "type": "pong" })),
            "subscribe_events" => {
                subscriptions.push(id);
                replies.push(ok(id));
                replies.push(state_changed(id, "sensor.boot", "ready", &json!({})));
            }
            "unsubscribe_events" => {
                let target = frame["subscription"].as_u64();
                subscriptions.retain(|s| Some(*s) != target);
                replies.push(ok(id));
            }
            "call_service" => {
                let service = frame["service"].as_str().unwrap_or_default();
                let entity = frame["target"]["entity_id"][0].as_str().unwrap_or_default();
                if service == "explode" {
                    replies.push(json!({
                        "id": id, "type": "result", "success": false,
                        "error": { "code": "service_not_found", "message": "Service not found." }
                    }));
                } else {
                    replies.push(ok(id));
                    let new_state = match service {
                        "turn_on" => Some("on"),
                        "turn_off" => Some("off"),
                        _ => None,
                    };
                    if let Some(state) = new_state.filter(|_| !entity.ends_with(".stuck")) {
                        let attributes = frame.get("service_data").cloned().unwrap_or_else(|| json!({}));
                        for &sub in &subscriptions {
                            replies.push(state_changed(sub, entity, state, &attributes));
                        }
                    }
                }
            }
            _ => replies.push(json!({
                "id": id, "type": "result", "success": false,
                "error": { "code": "unknown_command", "message": "Unknown command." }
            })),
        }
        for reply in replies {
            if send(&mut ws, reply).await.is_err() {
                return;
            }
        }
    }
}

fn ok(id: u64) -> Value {
    json!({ "id": id, "type": "result", "success": true, "result": null })
}

fn state_changed(subscription: u64, entity: &str, state: &str, attributes: &Value) -> Value {
    json!({
        "id": subscription,
        "type": "event",
        "event": {
            "event_type": "state_changed",
            "data": {
                "entity_id": entity,
                "new_state": { "entity_id": entity, "state": state, "attributes": attributes }
            },
            "origin": "LOCAL"
        }
    })
}

async fn send(ws: &mut WebSocketStream<TcpStream>, frame: Value) -> Result<(), ()> {
    ws.send(Message::Text(frame.to_string().into())).await.map_err(|_| ())
}

async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Option<Value> {
    while let Some(Ok(msg)) = ws.next().await {
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).ok(),
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}
