//! In-process fake of the remote WebSocket API

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use ha_config::SyncConfig;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;

pub const TOKEN: &str = "test-token";

/// A frame the server received after authentication
#[derive(Debug, Clone)]
pub struct Received {
    pub session: usize,
    pub id: u64,
    pub kind: String,
    pub body: Value,
}

#[derive(Default)]
struct Shared {
    frames: Mutex<Vec<Received>>,
    states: Mutex<HashMap<String, Value>>,
    sessions: AtomicUsize,
    mute_pongs: AtomicBool,
    /// Sessions still to be closed instead of answering the subscription
    close_before_subscribed: AtomicUsize,
    /// Sessions still to be closed right after answering the subscription
    close_after_subscribed: AtomicUsize,
}

/// Consume one unit of a countdown; false once it is exhausted
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub struct MockServer {
    pub url: String,
    shared: Arc<Shared>,
    kill: broadcast::Sender<()>,
    events: broadcast::Sender<Value>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let shared = Arc::new(Shared::default());
        let (kill, _) = broadcast::channel(16);
        let (events, _) = broadcast::channel(64);

        let server = MockServer {
            url,
            shared: shared.clone(),
            kill: kill.clone(),
            events: events.clone(),
        };

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(
                    stream,
                    shared.clone(),
                    kill.subscribe(),
                    events.subscribe(),
                ));
            }
        });

        server
    }

    pub fn config(&self) -> SyncConfig {
        let mut config = SyncConfig::new(self.url.clone(), TOKEN);
        config.request_timeout = Duration::from_millis(500);
        config.heartbeat_interval = Duration::from_secs(30);
        config.reconnect.initial_backoff = Duration::from_millis(20);
        config.reconnect.max_backoff = Duration::from_millis(200);
        config
    }

    /// Authenticated sessions served so far
    pub fn sessions(&self) -> usize {
        self.shared.sessions.load(Ordering::SeqCst)
    }

    pub fn frames(&self, session: usize) -> Vec<Received> {
        self.shared
            .frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.session == session)
            .cloned()
            .collect()
    }

    pub fn set_state(&self, entity_id: &str, state: &str) {
        self.shared.states.lock().unwrap().insert(
            entity_id.to_string(),
            json!({"entity_id": entity_id, "state": state, "attributes": {}}),
        );
    }

    /// Drop every open connection without a close frame
    pub fn kill_connections(&self) {
        let _ = self.kill.send(());
    }

    pub fn mute_pongs(&self, mute: bool) {
        self.shared.mute_pongs.store(mute, Ordering::SeqCst);
    }

    /// Close the next `sessions` connections on their subscription request
    pub fn close_before_subscribed(&self, sessions: usize) {
        self.shared.close_before_subscribed.store(sessions, Ordering::SeqCst);
    }

    /// Close the next `sessions` connections right after the subscription
    /// result is sent
    pub fn close_after_subscribed(&self, sessions: usize) {
        self.shared.close_after_subscribed.store(sessions, Ordering::SeqCst);
    }

    /// Push a state_changed event to every connected client
    pub fn push_state_change(&self, entity_id: &str, old: &str, new: &str) {
        self.set_state(entity_id, new);
        let _ = self.events.send(json!({
            "entity_id": entity_id,
            "old_state": {"entity_id": entity_id, "state": old, "attributes": {}},
            "new_state": {"entity_id": entity_id, "state": new, "attributes": {}},
        }));
    }
}

async fn serve(
    stream: TcpStream,
    shared: Arc<Shared>,
    mut kill: broadcast::Receiver<()>,
    mut events: broadcast::Receiver<Value>,
) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };

    let hello = json!({"type": "auth_required", "ha_version": "2026.1.0"});
    if ws.send(Message::Text(hello.to_string())).await.is_err() {
        return;
    }

    let auth: Value = match ws.next().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str(&text).unwrap_or_default(),
        _ => return,
    };
    if auth["access_token"] != TOKEN {
        let reply = json!({"type": "auth_invalid", "message": "Invalid access token or password"});
        let _ = ws.send(Message::Text(reply.to_string())).await;
        let _ = ws.close(None).await;
        return;
    }
    let ok = json!({"type": "auth_ok", "ha_version": "2026.1.0"});
    if ws.send(Message::Text(ok.to_string())).await.is_err() {
        return;
    }
    let session = shared.sessions.fetch_add(1, Ordering::SeqCst) + 1;
    let mut subscription: Option<u64> = None;

    loop {
        tokio::select! {
            _ = kill.recv() => return,
            event = events.recv() => {
                let (Ok(data), Some(sub)) = (event, subscription) else { continue };
                let frame = json!({
                    "id": sub,
                    "type": "event",
                    "event": {"event_type": "state_changed", "data": data, "origin": "LOCAL"},
                });
                if ws.send(Message::Text(frame.to_string())).await.is_err() {
                    return;
                }
            }
            frame = ws.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                };
                let body: Value = serde_json::from_str(&text).unwrap();
                let id = body["id"].as_u64().unwrap();
                let kind = body["type"].as_str().unwrap_or_default().to_string();
                shared.frames.lock().unwrap().push(Received {
                    session,
                    id,
                    kind: kind.clone(),
                    body: body.clone(),
                });

                let reply = match kind.as_str() {
                    "subscribe_events" if take_one(&shared.close_before_subscribed) => {
                        let _ = ws.close(None).await;
                        return;
                    }
                    "subscribe_events" if take_one(&shared.close_after_subscribed) => {
                        let ok = json!({"id": id, "type": "result", "success": true, "result": null});
                        let _ = ws.send(Message::Text(ok.to_string())).await;
                        let _ = ws.close(None).await;
                        return;
                    }
                    "subscribe_events" => {
                        subscription = Some(id);
                        Some(json!({"id": id, "type": "result", "success": true, "result": null}))
                    }
                    "get_states" => {
                        let states: Vec<Value> =
                            shared.states.lock().unwrap().values().cloned().collect();
                        Some(json!({"id": id, "type": "result", "success": true, "result": states}))
                    }
                    "ping" if shared.mute_pongs.load(Ordering::SeqCst) => None,
                    "ping" => Some(json!({"id": id, "type": "pong"})),
                    "call_service" => match body["service"].as_str() {
                        Some("hang") => None,
                        Some("drop") => return,
                        Some("fail") => Some(json!({
                            "id": id, "type": "result", "success": false,
                            "error": {"code": "service_validation_error", "message": "rejected"}
                        })),
                        _ => Some(json!({"id": id, "type": "result", "success": true, "result": null})),
                    },
                    _ => Some(json!({
                        "id": id, "type": "result", "success": false,
                        "error": {"code": "unknown_command", "message": "Unknown command."}
                    })),
                };

                if let Some(reply) = reply {
                    if ws.send(Message::Text(reply.to_string())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Poll until `check` holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
