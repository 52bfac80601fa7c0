//! In-memory remote source for store tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ha_core::{
    RemoteChangeHandler, RemoteError, RemoteResult, RemoteSource, State, StateChangedData,
    SubscriptionId,
};
use ha_event_bus::EventBus;
use serde_json::Value;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    pub data: Value,
}

impl ServiceCall {
    pub fn entity_id(&self) -> &str {
        self.data["entity_id"].as_str().unwrap_or_default()
    }
}

pub struct MockRemote {
    states: Mutex<HashMap<String, State>>,
    calls: Mutex<Vec<ServiceCall>>,
    handlers: EventBus<StateChangedData>,
    connected: watch::Sender<bool>,
    /// Apply service calls to the entity and emit the change, like the real thing
    echo: AtomicBool,
    bulk_reads: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        let (connected, _) = watch::channel(true);
        Arc::new(Self {
            states: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            handlers: EventBus::new(),
            connected,
            echo: AtomicBool::new(false),
            bulk_reads: AtomicUsize::new(0),
        })
    }

    /// Set an entity's state without emitting an event
    pub fn set_state(&self, entity_id: &str, state: &str) {
        self.states
            .lock()
            .unwrap()
            .insert(entity_id.to_string(), State::new(entity_id, state));
    }

    /// Change an entity's state and emit state_changed to subscribers
    pub fn push_change(&self, entity_id: &str, state: &str) {
        let old_state = self
            .states
            .lock()
            .unwrap()
            .insert(entity_id.to_string(), State::new(entity_id, state));
        let data = StateChangedData {
            entity_id: entity_id.to_string(),
            old_state,
            new_state: Some(State::new(entity_id, state)),
        };
        self.handlers.dispatch(entity_id, &data);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }

    pub fn set_echo(&self, echo: bool) {
        self.echo.store(echo, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, entity_id: &str) -> Vec<ServiceCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.entity_id() == entity_id)
            .collect()
    }

    pub fn bulk_reads(&self) -> usize {
        self.bulk_reads.load(Ordering::SeqCst)
    }

    pub fn remote_subscribers(&self, entity_id: &str) -> usize {
        self.handlers.subscriber_count(entity_id)
    }
}

#[async_trait]
impl RemoteSource for MockRemote {
    async fn get_all_states(&self) -> RemoteResult<Vec<State>> {
        if !self.is_connected() {
            return Err(RemoteError::NotConnected);
        }
        self.bulk_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.states.lock().unwrap().values().cloned().collect())
    }

    async fn call_service(&self, domain: &str, service: &str, data: Value) -> RemoteResult<()> {
        if !self.is_connected() {
            return Err(RemoteError::NotConnected);
        }
        let call = ServiceCall {
            domain: domain.to_string(),
            service: service.to_string(),
            data,
        };
        self.calls.lock().unwrap().push(call.clone());

        if self.echo.load(Ordering::SeqCst) {
            let state = match service {
                "turn_on" => "on".to_string(),
                "turn_off" => "off".to_string(),
                _ => match &call.data["value"] {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
            };
            self.push_change(call.entity_id(), &state);
        }
        Ok(())
    }

    fn subscribe_state_changes(&self, entity_id: &str, handler: RemoteChangeHandler) -> SubscriptionId {
        self.handlers.subscribe(entity_id, handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.handlers.unsubscribe(id)
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn wait_connected(&self) {
        let mut rx = self.connected.subscribe();
        let _ = rx.wait_for(|up| *up).await;
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
