//! Scripted in-process hub speaking the real-time WebSocket protocol.
#![allow(dead_code, clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

pub const TOKEN: &str = "good-token";
pub const HUB_VERSION: &str = "2026.10.0";

/// A hub that authenticates [`TOKEN`], answers commands, and lets the test
/// push state changes, drop every live connection, or stop answering pings.
#[derive(Clone)]
pub struct MockHub {
    pub url: Url,
    push: broadcast::Sender<String>,
    kill: broadcast::Sender<()>,
    received: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
    mute_pings: Arc<AtomicBool>,
}

impl MockHub {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (push, _) = broadcast::channel(256);
        let (kill, _) = broadcast::channel(8);

        let hub = Self {
            url: Url::parse(&format!("ws://{addr}/api/websocket")).unwrap(),
            push,
            kill,
            received: Arc::default(),
            connections: Arc::default(),
            mute_pings: Arc::default(),
        };

        let acceptor = hub.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let hub = acceptor.clone();
                tokio::spawn(async move { hub.serve(stream).await });
            }
        });

        hub
    }

    /// Send a raw text frame to every authenticated connection.
    pub fn push(&self, frame: impl ToString) {
        let _ = self.push.send(frame.to_string());
    }

    pub fn push_state_changed(&self, subscription: u64, entity: &str, state: &str, attributes: Value) {
        self.push(json!({
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
        }));
    }

    /// Abruptly drop every live connection (no close frame).
    pub fn drop_connections(&self) {
        let _ = self.kill.send(());
    }

    /// Stop (or resume) answering `ping` frames.
    pub fn mute_pings(&self, mute: bool) {
        self.mute_pings.store(mute, Ordering::SeqCst);
    }

    /// Push a `state_changed` event on the most recent subscription.
    pub fn emit(&self, entity: &str, state: &str, attributes: Value) {
        let subscription = self.subscription_id().unwrap_or_default();
        self.push_state_changed(subscription, entity, state, attributes);
    }

    /// Number of successful authentications so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_of(&self, kind: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|frame| frame["type"] == kind)
            .collect()
    }

    /// Id of the most recent `subscribe_events` request.
    pub fn subscription_id(&self) -> Option<u64> {
        self.received_of("subscribe_events")
            .last()
            .and_then(|frame| frame["id"].as_u64())
    }

    async fn serve(&self, stream: TcpStream) {
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        let mut push_rx = self.push.subscribe();
        let mut kill_rx = self.kill.subscribe();

        if send(&mut ws, json!({ "type": "auth_required", "ha_version": HUB_VERSION })).await.is_err() {
            return;
        }
        let Some(auth) = next_json(&mut ws).await else {
            return;
        };
        if auth["access_token"] != TOKEN {
            let _ = send(&mut ws, json!({ "type": "auth_invalid", "message": "Invalid access token" })).await;
            let _ = ws.close(None).await;
            return;
        }
        if send(&mut ws, json!({ "type": "auth_ok", "ha_version": HUB_VERSION })).await.is_err() {
            return;
        }
        self.connections.fetch_add(1, Ordering::SeqCst);

        loop {
            tokio::select! {
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(frame) = serde_json::from_str::<Value>(&text) else { continue };
                        self.received.lock().unwrap().push(frame.clone());
                        if frame["type"] == "ping" && self.mute_pings.load(Ordering::SeqCst) {
                            continue;
                        }
                        for reply in respond(&frame) {
                            if send(&mut ws, reply).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_)) | Err(_)) | None => return,
                    Some(Ok(_)) => {}
                },
                Ok(raw) = push_rx.recv() => {
                    if ws.send(Message::Text(raw.into())).await.is_err() {
                        return;
                    }
                }
                Ok(()) = kill_rx.recv() => return,
            }
        }
    }
}

/// Canned answers. `call_service` to `explode` is rejected, to `hang` is
/// never answered, anything else echoes its id.
fn respond(frame: &Value) -> Vec<Value> {
    let id = frame["id"].clone();
    match frame["type"].as_str().unwrap_or_default() {
        "ping" => vec![json!({ "id": id, "type": "pong" })],
        "subscribe_events" | "unsubscribe_events" => {
            vec![json!({ "id": id, "type": "result", "success": true, "result": null })]
        }
        "call_service" => match frame["service"].as_str().unwrap_or_default() {
            "explode" => vec![json!({
                "id": id, "type": "result", "success": false,
                "error": { "code": "service_not_found", "message": "Service light.explode not found." }
            })],
            "hang" => vec![],
            _ => vec![json!({ "id": id, "type": "result", "success": true, "result": { "echo": id } })],
        },
        _ => vec![json!({
            "id": id, "type": "result", "success": false,
            "error": { "code": "unknown_command", "message": "Unknown command." }
        })],
    }
}

async fn send(ws: &mut WebSocketStream<TcpStream>, frame: Value) -> Result<(), ()> {
    ws.send(Message::Text(frame.to_string().into())).await.map_err(|_| ())
}

async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Option<Value> {
    while let Some(Ok(msg)) = ws.next().await {
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).ok();
        }
    }
    None
}
