//! Reconnecting client for the remote WebSocket API
//!
//! The [`Client`] keeps at most one live [`Session`]. When the connection
//! drops, in-flight requests fail, the session is discarded and a
//! background loop reconnects with exponential backoff. Entity
//! subscriptions are held by the client, not the session, so they keep
//! receiving events once a new session is up.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use ha_config::SyncConfig;
use ha_core::events::STATE_CHANGED;
use ha_core::{
    RemoteChangeHandler, RemoteError, RemoteResult, RemoteSource, State, StateChangedData,
    SubscriptionId,
};
use ha_event_bus::EventBus;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::backoff::Backoff;
use crate::session::Session;
use crate::types::{AuthMessage, EventPayload, IncomingMessage, Request};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Client for the remote WebSocket API
///
/// Cheap to clone; clones share the same connection and subscriptions.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    config: SyncConfig,
    session: RwLock<Option<Arc<Session>>>,
    connected: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    generation: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnecting: AtomicBool,
    /// Serializes handshakes so two sessions never coexist
    handshake: tokio::sync::Mutex<()>,
    entity_handlers: EventBus<StateChangedData>,
}

impl Client {
    pub fn new(config: SyncConfig) -> Self {
        let (connected, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                session: RwLock::new(None),
                connected,
                shutdown,
                generation: AtomicU64::new(0),
                reconnect_attempts: AtomicU64::new(0),
                reconnecting: AtomicBool::new(false),
                handshake: tokio::sync::Mutex::new(()),
                entity_handlers: EventBus::new(),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Open a session: connect, authenticate, subscribe to state changes
    ///
    /// A single attempt; fails with [`RemoteError::Authentication`] on a
    /// rejected token and [`RemoteError::Connection`] on network failure.
    /// Once connected, lost connections are re-established in the
    /// background until [`Client::disconnect`] is called.
    pub async fn connect(&self) -> RemoteResult<()> {
        self.inner.shutdown.send_replace(false);
        if self.is_connected() {
            debug!("Already connected");
            return Ok(());
        }
        self.inner.establish().await
    }

    /// Connect, retrying with backoff until a session is up
    ///
    /// Authentication failures are not retried.
    pub async fn connect_with_retry(&self) -> RemoteResult<()> {
        self.inner.shutdown.send_replace(false);
        let mut backoff = Backoff::new(&self.inner.config.reconnect);
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e @ RemoteError::Authentication(_)) => return Err(e),
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, backoff_ms = delay.as_millis() as u64, "Connect failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait_for(|stop| *stop) => {
                            return Err(RemoteError::Connection("shut down while connecting".to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Close the session and stop reconnecting
    ///
    /// In-flight requests fail with a connection error.
    pub async fn disconnect(&self) {
        self.inner.shutdown.send_replace(true);
        let _guard = self.inner.handshake.lock().await;
        let session = {
            let mut slot = self.inner.session.write().unwrap_or_else(PoisonError::into_inner);
            self.inner.connected.send_replace(false);
            slot.take()
        };

        if let Some(session) = session {
            let failed = session.close();
            info!(generation = session.generation(), failed_requests = failed, "Disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Watch the connected flag; used to resync after reconnects
    pub fn connection_status(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Number of sessions opened so far
    pub fn session_generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Reconnect attempts in the current outage; zero while connected
    pub fn reconnect_attempts(&self) -> u64 {
        self.inner.reconnect_attempts.load(Ordering::Acquire)
    }

    /// Send a request on the live session and await its response
    pub async fn send(&self, request: Request) -> RemoteResult<Value> {
        let session = self.inner.live_session().ok_or(RemoteError::NotConnected)?;
        session.request(&request).await
    }

    // =========================================================================
    // Requests
    // =========================================================================

    pub async fn get_all_states(&self) -> RemoteResult<Vec<State>> {
        let result = self.send(Request::GetStates).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Fetch one entity's state from the full state list
    pub async fn get_state(&self, entity_id: &str) -> RemoteResult<State> {
        self.get_all_states()
            .await?
            .into_iter()
            .find(|s| s.entity_id == entity_id)
            .ok_or_else(|| RemoteError::Remote {
                code: "not_found".to_string(),
                message: format!("entity {} not found", entity_id),
            })
    }

    pub async fn call_service(&self, domain: &str, service: &str, data: Value) -> RemoteResult<()> {
        self.send(Request::call_service(domain, service, data))
            .await
            .map(|_| ())
    }

    pub async fn set_input_boolean(&self, name: &str, value: bool) -> RemoteResult<()> {
        let service = if value { "turn_on" } else { "turn_off" };
        self.call_service(
            "input_boolean",
            service,
            json!({ "entity_id": format!("input_boolean.{}", name) }),
        )
        .await
    }

    pub async fn set_input_number(&self, name: &str, value: f64) -> RemoteResult<()> {
        self.call_service(
            "input_number",
            "set_value",
            json!({ "entity_id": format!("input_number.{}", name), "value": value }),
        )
        .await
    }

    pub async fn set_input_text(&self, name: &str, value: &str) -> RemoteResult<()> {
        self.call_service(
            "input_text",
            "set_value",
            json!({ "entity_id": format!("input_text.{}", name), "value": value }),
        )
        .await
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Register a handler for one entity's state changes
    ///
    /// Handlers run on the connection's reader task: they must not block,
    /// and must not await responses on this client from inside the call.
    pub fn subscribe_state_changes<F>(&self, entity_id: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&StateChangedData) + Send + Sync + 'static,
    {
        self.inner.entity_handlers.subscribe(entity_id, Arc::new(handler))
    }

    /// Remove exactly one handler registration
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.entity_handlers.unsubscribe(id)
    }
}

#[async_trait]
impl RemoteSource for Client {
    async fn get_all_states(&self) -> RemoteResult<Vec<State>> {
        Client::get_all_states(self).await
    }

    async fn call_service(&self, domain: &str, service: &str, data: Value) -> RemoteResult<()> {
        Client::call_service(self, domain, service, data).await
    }

    fn subscribe_state_changes(&self, entity_id: &str, handler: RemoteChangeHandler) -> SubscriptionId {
        self.inner.entity_handlers.subscribe(entity_id, handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        Client::unsubscribe(self, id)
    }

    fn is_connected(&self) -> bool {
        Client::is_connected(self)
    }

    async fn wait_connected(&self) {
        let mut connected = self.inner.connected.subscribe();
        let _ = connected.wait_for(|up| *up).await;
    }
}

impl Inner {
    fn live_session(&self) -> Option<Arc<Session>> {
        if !*self.connected.borrow() {
            return None;
        }
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Handshake a new session and install it
    ///
    /// The state-change subscription is the session's first request, so it
    /// always carries ID 1, and it completes before the client reports
    /// itself connected.
    #[instrument(skip(self), fields(url = %self.config.ws_url()))]
    async fn establish(self: &Arc<Self>) -> RemoteResult<()> {
        let _guard = self.handshake.lock().await;
        if *self.connected.borrow() {
            return Ok(());
        }

        let wait = self.config.request_timeout;
        let url = self.config.ws_url();
        let (stream, _) = timeout(wait, connect_async(url.as_str()))
            .await
            .map_err(|_| RemoteError::Connection("connect timed out".to_string()))?
            .map_err(|e| RemoteError::Connection(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        match recv_handshake(&mut source, wait).await? {
            IncomingMessage::AuthRequired { .. } => {}
            other => {
                return Err(RemoteError::Protocol(format!(
                    "expected auth_required, got {:?}",
                    other
                )))
            }
        }

        let auth = serde_json::to_string(&AuthMessage::new(&self.config.token))?;
        sink.send(Message::Text(auth))
            .await
            .map_err(|e| RemoteError::Connection(e.to_string()))?;

        match recv_handshake(&mut source, wait).await? {
            IncomingMessage::AuthOk { ha_version } => {
                debug!(ha_version = ?ha_version, "Authenticated");
            }
            IncomingMessage::AuthInvalid { message } => {
                let _ = sink.close().await;
                let message = message.unwrap_or_else(|| "invalid access token".to_string());
                warn!(reason = %message, "Authentication rejected");
                return Err(RemoteError::Authentication(message));
            }
            other => {
                return Err(RemoteError::Protocol(format!(
                    "expected auth_ok, got {:?}",
                    other
                )))
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(generation, outbound, self.config.request_timeout));

        tokio::spawn(write_loop(Arc::downgrade(self), generation, sink, outbound_rx));
        tokio::spawn(read_loop(Arc::downgrade(self), session.clone(), source));
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());

        let subscribe = Request::SubscribeEvents {
            event_type: Some(STATE_CHANGED.to_string()),
        };
        if let Err(e) = session.request(&subscribe).await {
            warn!(generation, error = %e, "State change subscription failed");
            self.discard(&session);
            return Err(e);
        }

        // The reader may have torn the session down right after the
        // subscription result; it must still be installed to go live.
        {
            let slot = self.session.write().unwrap_or_else(PoisonError::into_inner);
            let installed = slot.as_ref().map(|s| s.generation()) == Some(generation);
            if !installed || session.is_closed() {
                drop(slot);
                warn!(generation, "Session lost during handshake");
                session.close();
                return Err(RemoteError::Connection("session lost during handshake".to_string()));
            }
            self.reconnect_attempts.store(0, Ordering::Release);
            self.connected.send_replace(true);
        }

        tokio::spawn(heartbeat_loop(
            Arc::downgrade(self),
            session.clone(),
            self.config.heartbeat_interval,
        ));

        info!(generation, "Connected");
        Ok(())
    }

    /// Drop a session that never became live
    fn discard(&self, session: &Arc<Session>) {
        let mut slot = self.session.write().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().map(|s| s.generation()) == Some(session.generation()) {
            slot.take();
        }
        drop(slot);
        session.close();
    }

    /// Tear down a session and start reconnecting if it was live
    ///
    /// Reader, writer and heartbeat may all notice the same failure; only
    /// the first caller for a given generation does anything. A session
    /// lost before it went live is left to whoever is establishing it.
    fn session_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        let (session, was_live) = {
            let mut slot = self.session.write().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(s) if s.generation() == generation => {
                    let session = slot.take();
                    (session, self.connected.send_replace(false))
                }
                _ => (None, false),
            }
        };
        let Some(session) = session else {
            return;
        };

        let failed = session.close();
        if !was_live {
            debug!(generation, reason, "Session lost before going live");
            return;
        }
        warn!(generation, reason, failed_requests = failed, "Connection lost");

        if !self.is_shutdown() {
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        tokio::spawn(self.clone().reconnect_loop());
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut backoff = Backoff::new(&self.config.reconnect);
        let mut shutdown = self.shutdown.subscribe();

        while !self.is_shutdown() {
            let delay = backoff.next_delay();
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::AcqRel) + 1;
            info!(attempt, backoff_ms = delay.as_millis() as u64, "Reconnecting");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }

            match self.establish().await {
                Ok(()) => {
                    info!(attempt, generation = self.generation.load(Ordering::Acquire), "Reconnected");
                    break;
                }
                Err(RemoteError::Authentication(reason)) => {
                    error!(attempt, reason = %reason, "Reconnect rejected by remote");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                }
            }
        }

        self.reconnecting.store(false, Ordering::SeqCst);

        // A session lost between going live and the flag clearing found
        // the loop still running and did not start another
        if !*self.connected.borrow() && !self.is_shutdown() {
            self.spawn_reconnect();
        }
    }

    fn handle_frame(&self, session: &Session, text: &str) {
        let message = match serde_json::from_str::<IncomingMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Unparseable frame");
                return;
            }
        };

        match message {
            IncomingMessage::Result {
                id,
                success,
                result,
                error,
            } => {
                let outcome = if success {
                    Ok(result.unwrap_or(Value::Null))
                } else {
                    let (code, message) = error
                        .map(|e| (e.code, e.message))
                        .unwrap_or_else(|| ("unknown_error".to_string(), String::new()));
                    Err(RemoteError::Remote { code, message })
                };
                if !session.resolve(id, outcome) {
                    debug!(id, "Result for unknown request");
                }
            }
            IncomingMessage::Pong { id } => {
                session.resolve(id, Ok(Value::Null));
            }
            IncomingMessage::Event { event, .. } => self.handle_event(event),
            other => trace!(message = ?other, "Ignoring message"),
        }
    }

    fn handle_event(&self, event: EventPayload) {
        if event.event_type != STATE_CHANGED {
            return;
        }
        let data: StateChangedData = match serde_json::from_value(event.data) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Malformed state_changed payload");
                return;
            }
        };
        let dispatched = self.entity_handlers.dispatch(&data.entity_id, &data);
        trace!(
            entity_id = %data.entity_id,
            delivered = dispatched.delivered,
            "Dispatched state change"
        );
    }
}

async fn recv_handshake(source: &mut WsSource, wait: Duration) -> RemoteResult<IncomingMessage> {
    loop {
        let frame = timeout(wait, source.next())
            .await
            .map_err(|_| RemoteError::Connection("handshake timed out".to_string()))?;
        match frame {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text).map_err(|e| RemoteError::Protocol(e.to_string()))
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(RemoteError::Connection("closed during handshake".to_string()))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(RemoteError::Connection(e.to_string())),
        }
    }
}

async fn write_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut sink: WsSink,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = sink.send(message).await {
            if let Some(inner) = inner.upgrade() {
                inner.session_lost(generation, &format!("write failed: {}", e));
            }
            return;
        }
    }
    // Session closed; say goodbye so the remote end drops the socket
    let _ = sink.close().await;
}

async fn read_loop(inner: Weak<Inner>, session: Arc<Session>, mut source: WsSource) {
    let mut closed = session.closed_signal();
    let reason = loop {
        let frame = tokio::select! {
            frame = source.next() => frame,
            _ = closed.wait_for(|c| *c) => return,
        };
        match frame {
            Some(Ok(Message::Text(text))) => match inner.upgrade() {
                Some(inner) => inner.handle_frame(&session, &text),
                None => return,
            },
            Some(Ok(Message::Close(frame))) => break format!("closed by remote: {:?}", frame),
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("read failed: {}", e),
            None => break "stream ended".to_string(),
        }
    };
    if let Some(inner) = inner.upgrade() {
        inner.session_lost(session.generation(), &reason);
    }
}

async fn heartbeat_loop(inner: Weak<Inner>, session: Arc<Session>, interval: Duration) {
    let mut closed = session.closed_signal();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = closed.wait_for(|c| *c) => return,
        }
        match session.request(&Request::Ping).await {
            Ok(_) | Err(RemoteError::Remote { .. }) => {
                trace!(generation = session.generation(), "Heartbeat ok");
            }
            Err(e) => {
                if let Some(inner) = inner.upgrade() {
                    inner.session_lost(session.generation(), &format!("heartbeat failed: {}", e));
                }
                return;
            }
        }
    }
}
