//! The typed state store
//!
//! Values live in a concurrent map keyed by variable name. Each key also
//! owns a FIFO of change events waiting for delivery. Whoever applies a
//! change to an idle key drains its FIFO, with no map lock held while
//! subscribers run, so handlers may freely read and write the store.
//! Events for one key therefore reach subscribers in the order the
//! changes were applied, and a write made from inside a handler is
//! delivered after the event currently being handled.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use ha_core::schedule::{Scheduler, TaskHandle};
use ha_core::{
    ChangeEvent, RemoteSource, State, StateChangedData, StateValue, SubscriptionId, ValueKind,
};
use ha_event_bus::EventBus;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::{StoreError, StoreResult};
use crate::variables::{default_variables, StateVariable};
use crate::writer::{write_loop, WriteBack, WriteOrigin, WriterCommand};

/// Where a change came from; decides whether it is mirrored remotely
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Plugin,
    Computed,
    Remote,
    Sync,
}

impl Origin {
    fn write_back(self) -> Option<WriteOrigin> {
        match self {
            Origin::Plugin => Some(WriteOrigin::Plugin),
            Origin::Computed => Some(WriteOrigin::Computed),
            Origin::Remote | Origin::Sync => None,
        }
    }
}

#[derive(Default)]
struct Slot {
    value: Option<StateValue>,
    /// Bumped on every applied change
    version: u64,
    pending: VecDeque<ChangeEvent>,
    draining: bool,
}

/// Outcome of [`StateStore::sync_from_source`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Variables read from their remote entity
    pub synced: usize,
    /// Variables that fell back to their default
    pub defaulted: usize,
    pub local: usize,
    /// Variables whose stored value changed
    pub changed: usize,
}

/// Concurrent, typed mirror of the remote entities plus local variables
pub struct StateStore {
    variables: HashMap<String, StateVariable>,
    /// Registration order, for deterministic syncs
    order: Vec<String>,
    slots: DashMap<String, Slot>,
    subscribers: EventBus<ChangeEvent>,
    computed: DashSet<String>,
    remote: Arc<dyn RemoteSource>,
    remote_subscriptions: DashMap<String, SubscriptionId>,
    writer: mpsc::UnboundedSender<WriterCommand>,
    read_only: bool,
    this: Weak<StateStore>,
}

impl StateStore {
    /// Store over the standard home automation variables
    ///
    /// Must be called from within a tokio runtime; the write-back task is
    /// spawned here.
    pub fn new(remote: Arc<dyn RemoteSource>) -> Arc<Self> {
        Self::with_options(remote, default_variables(), false)
    }

    /// Store over a custom variable set
    ///
    /// In read-only mode plugins may still write local-only variables and
    /// computed outputs; everything else refuses writes.
    pub fn with_options(
        remote: Arc<dyn RemoteSource>,
        variables: Vec<StateVariable>,
        read_only: bool,
    ) -> Arc<Self> {
        let order = variables.iter().map(|v| v.key.clone()).collect();
        let variables = variables
            .into_iter()
            .map(|v| (v.key.clone(), v))
            .collect();

        Arc::new_cyclic(|this: &Weak<StateStore>| {
            let (writer, commands) = mpsc::unbounded_channel();
            tokio::spawn(write_loop(commands, remote.clone(), this.clone()));

            Self {
                variables,
                order,
                slots: DashMap::new(),
                subscribers: EventBus::new(),
                computed: DashSet::new(),
                remote,
                remote_subscriptions: DashMap::new(),
                writer,
                read_only,
                this: this.clone(),
            }
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn variable(&self, key: &str) -> Option<&StateVariable> {
        self.variables.get(key)
    }

    /// Variables in registration order
    pub fn variables(&self) -> impl Iterator<Item = &StateVariable> {
        self.order.iter().filter_map(|k| self.variables.get(k))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Whatever value is stored under `key`
    pub fn get(&self, key: &str) -> StoreResult<StateValue> {
        self.slots
            .get(key)
            .and_then(|slot| slot.value.clone())
            .ok_or_else(|| StoreError::not_found(key))
    }

    pub fn get_bool(&self, key: &str) -> StoreResult<bool> {
        let value = self.get(key)?;
        value
            .as_bool()
            .ok_or_else(|| StoreError::mismatch(key, ValueKind::Bool, value.kind()))
    }

    pub fn get_number(&self, key: &str) -> StoreResult<f64> {
        let value = self.get(key)?;
        value
            .as_number()
            .ok_or_else(|| StoreError::mismatch(key, ValueKind::Number, value.kind()))
    }

    pub fn get_string(&self, key: &str) -> StoreResult<String> {
        match self.get(key)? {
            StateValue::String(s) => Ok(s),
            other => Err(StoreError::mismatch(key, ValueKind::String, other.kind())),
        }
    }

    pub fn get_structured(&self, key: &str) -> StoreResult<serde_json::Value> {
        match self.get(key)? {
            StateValue::Structured(doc) => Ok(doc),
            other => Err(StoreError::mismatch(key, ValueKind::Structured, other.kind())),
        }
    }

    /// Type-inferring read: tries bool, then string, then number
    ///
    /// Structured values are never inferred.
    pub fn get_inferred(&self, key: &str) -> StoreResult<StateValue> {
        let value = self.get(key)?;
        if ValueKind::INFERENCE_ORDER.contains(&value.kind()) {
            Ok(value)
        } else {
            Err(StoreError::TypeMismatch {
                key: key.to_string(),
                expected: "bool, string or number",
                actual: value.kind(),
            })
        }
    }

    /// Copy of every synchronized value
    pub fn snapshot(&self) -> HashMap<String, StateValue> {
        self.slots
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .value
                    .clone()
                    .map(|v| (entry.key().clone(), v))
            })
            .collect()
    }

    /// Synchronized keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| entry.value().value.is_some())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub(crate) fn version(&self, key: &str) -> Option<u64> {
        self.slots.get(key).map(|slot| slot.version)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Replace the value of `key`
    ///
    /// Local readers see the new value immediately. Subscribers are
    /// notified before this returns unless another thread is already
    /// delivering events for the key, in which case that thread delivers
    /// this one next. The remote write-back happens in the background.
    /// Setting the value already stored is a no-op.
    pub fn set(&self, key: &str, value: StateValue) -> StoreResult<()> {
        let variable = self.writable(key, value.kind(), Origin::Plugin)?;
        self.apply(variable, value, Origin::Plugin);
        Ok(())
    }

    pub fn set_bool(&self, key: &str, value: bool) -> StoreResult<()> {
        self.set(key, StateValue::Bool(value))
    }

    pub fn set_number(&self, key: &str, value: f64) -> StoreResult<()> {
        self.set(key, StateValue::Number(value))
    }

    pub fn set_string(&self, key: &str, value: impl Into<String>) -> StoreResult<()> {
        self.set(key, StateValue::String(value.into()))
    }

    pub fn set_structured(&self, key: &str, value: serde_json::Value) -> StoreResult<()> {
        self.set(key, StateValue::Structured(value))
    }

    /// Atomically set `key` to `new` if it currently holds `expected`
    ///
    /// Returns whether the swap happened. Of many callers racing on the
    /// same expected value, exactly one wins.
    pub fn compare_and_swap_bool(&self, key: &str, expected: bool, new: bool) -> StoreResult<bool> {
        let variable = self.writable(key, ValueKind::Bool, Origin::Plugin)?;

        let drain = {
            let mut slot = self
                .slots
                .get_mut(key)
                .ok_or_else(|| StoreError::not_found(key))?;
            let current = match &slot.value {
                Some(StateValue::Bool(b)) => *b,
                Some(other) => return Err(StoreError::mismatch(key, ValueKind::Bool, other.kind())),
                None => return Err(StoreError::not_found(key)),
            };
            if current != expected {
                return Ok(false);
            }
            if expected == new {
                return Ok(true);
            }
            self.commit(&mut slot, variable, StateValue::Bool(new), Origin::Plugin)
        };

        if drain {
            self.drain(key);
        }
        Ok(true)
    }

    /// Computed state engine write path; returns whether the value changed
    pub(crate) fn set_computed(&self, key: &str, value: StateValue) -> StoreResult<bool> {
        let variable = self.writable(key, value.kind(), Origin::Computed)?;
        Ok(self.apply(variable, value, Origin::Computed))
    }

    pub(crate) fn mark_computed(&self, key: &str) {
        self.computed.insert(key.to_string());
    }

    pub fn is_computed(&self, key: &str) -> bool {
        self.computed.contains(key)
    }

    /// Set `key` to `value` after `delay`, unless the handle is cancelled
    pub fn schedule_reset(
        &self,
        scheduler: &dyn Scheduler,
        key: &str,
        value: StateValue,
        delay: Duration,
    ) -> StoreResult<TaskHandle> {
        self.writable(key, value.kind(), Origin::Plugin)?;

        let store = self.this.clone();
        let key = key.to_string();
        debug!(key = %key, delay_ms = delay.as_millis() as u64, "Scheduling reset");
        Ok(scheduler.schedule(
            delay,
            Box::new(move || {
                let Some(store) = store.upgrade() else {
                    return;
                };
                if let Err(e) = store.set(&key, value) {
                    warn!(key = %key, error = %e, "Scheduled reset failed");
                }
            }),
        ))
    }

    /// Wait until every write-back queued so far has been attempted
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.writer.send(WriterCommand::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    fn writable(&self, key: &str, kind: ValueKind, origin: Origin) -> StoreResult<&StateVariable> {
        let variable = self
            .variables
            .get(key)
            .ok_or_else(|| StoreError::not_found(key))?;

        if variable.kind != kind {
            return Err(StoreError::mismatch(key, variable.kind, kind));
        }
        if origin == Origin::Plugin && self.is_computed(key) {
            return Err(StoreError::ComputedKey {
                key: key.to_string(),
            });
        }
        if variable.read_only
            || (self.read_only && !variable.local_only && !variable.computed_output)
        {
            return Err(StoreError::ReadOnly {
                key: key.to_string(),
            });
        }
        Ok(variable)
    }

    /// Store `value`, queue its event and write-back; false if unchanged
    fn apply(&self, variable: &StateVariable, value: StateValue, origin: Origin) -> bool {
        let key = variable.key.as_str();
        let drain = {
            let mut slot = self.slots.entry(key.to_string()).or_default();
            if slot.value.as_ref() == Some(&value) {
                trace!(key, "Value unchanged");
                return false;
            }
            self.commit(&mut slot, variable, value, origin)
        };

        if drain {
            self.drain(key);
        }
        true
    }

    /// Mutate a locked slot; returns true if the caller must drain
    fn commit(
        &self,
        slot: &mut Slot,
        variable: &StateVariable,
        value: StateValue,
        origin: Origin,
    ) -> bool {
        let old = slot.value.replace(value.clone());
        slot.version += 1;

        if let (Some(write_origin), Some(entity_id)) = (origin.write_back(), &variable.entity_id) {
            if !variable.local_only {
                let write = WriteBack {
                    key: variable.key.clone(),
                    entity_id: entity_id.clone(),
                    value: value.clone(),
                    version: slot.version,
                    origin: write_origin,
                };
                if self.writer.send(WriterCommand::Write(write)).is_err() {
                    warn!(key = %variable.key, "Write-back queue closed");
                }
            }
        }

        debug!(key = %variable.key, old = ?old, new = %value, origin = ?origin, "State changed");
        slot.pending.push_back(ChangeEvent::new(variable.key.clone(), old, value));

        if slot.draining {
            false
        } else {
            slot.draining = true;
            true
        }
    }

    /// Deliver queued events for `key` until its FIFO is empty
    fn drain(&self, key: &str) {
        loop {
            let event = {
                let Some(mut slot) = self.slots.get_mut(key) else {
                    return;
                };
                match slot.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        slot.draining = false;
                        return;
                    }
                }
            };
            self.subscribers.dispatch(key, &event);
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Register a handler for changes to `key`
    ///
    /// Handlers run outside every store lock and may call back into the
    /// store. A panicking handler is logged and skipped.
    pub fn subscribe<F>(&self, key: &str, handler: F) -> StoreResult<SubscriptionId>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        if !self.variables.contains_key(key) {
            return Err(StoreError::not_found(key));
        }
        let id = self.subscribers.subscribe(key, Arc::new(handler));
        trace!(key, subscription_id = %id, "Subscribed");
        Ok(id)
    }

    /// Remove exactly one subscription
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.subscribers.subscriber_count(key)
    }

    // =========================================================================
    // Remote synchronization
    // =========================================================================

    /// Read every remote entity and (re)populate the store
    ///
    /// Changed and newly populated values raise change events; unchanged
    /// values raise nothing, so a repeated sync is silent. Local-only
    /// variables are initialized on the first sync only.
    #[instrument(skip(self))]
    pub async fn sync_from_source(&self) -> StoreResult<SyncSummary> {
        info!("Syncing state from remote source");

        // Subscribe first so nothing slips in between the read and the
        // subscription.
        for variable in self.variables() {
            if variable.is_remote() {
                self.ensure_remote_subscription(variable);
            }
        }

        let states = self.remote.get_all_states().await?;
        let by_entity: HashMap<&str, &State> =
            states.iter().map(|s| (s.entity_id.as_str(), s)).collect();

        let mut summary = SyncSummary::default();
        for variable in self.variables() {
            let value = match &variable.entity_id {
                Some(entity_id) if !variable.local_only => {
                    let entity_id = entity_id.to_string();
                    match by_entity.get(entity_id.as_str()) {
                        None => {
                            warn!(key = %variable.key, entity_id = %entity_id, "Entity not found remotely, using default");
                            summary.defaulted += 1;
                            variable.default.clone()
                        }
                        Some(state) => match StateValue::parse(variable.kind, &state.state) {
                            Ok(value) => {
                                summary.synced += 1;
                                value
                            }
                            Err(e) => {
                                error!(key = %variable.key, entity_id = %entity_id, error = %e, "Failed to parse remote state, using default");
                                summary.defaulted += 1;
                                variable.default.clone()
                            }
                        },
                    }
                }
                _ => {
                    summary.local += 1;
                    if self.get(&variable.key).is_ok() {
                        continue;
                    }
                    variable.default.clone()
                }
            };

            if self.apply(variable, value, Origin::Sync) {
                summary.changed += 1;
            }
        }

        info!(
            synced = summary.synced,
            defaulted = summary.defaulted,
            local = summary.local,
            changed = summary.changed,
            "State sync complete"
        );
        Ok(summary)
    }

    fn ensure_remote_subscription(&self, variable: &StateVariable) {
        let Some(entity_id) = &variable.entity_id else {
            return;
        };
        let entity_id = entity_id.to_string();
        if self.remote_subscriptions.contains_key(&entity_id) {
            return;
        }

        let store = self.this.clone();
        let key = variable.key.clone();
        let id = self.remote.subscribe_state_changes(
            &entity_id,
            Arc::new(move |data: &StateChangedData| {
                if let Some(store) = store.upgrade() {
                    store.on_remote_change(&key, data);
                }
            }),
        );

        // A concurrent sync may have won the race
        if let Some(previous) = self.remote_subscriptions.insert(entity_id.clone(), id) {
            self.remote.unsubscribe(previous);
        }
        trace!(entity_id = %entity_id, subscription_id = %id, "Subscribed to remote entity");
    }

    /// Apply a remote change; our own write-back echoes change nothing and
    /// stay silent
    fn on_remote_change(&self, key: &str, data: &StateChangedData) {
        let Some(variable) = self.variables.get(key) else {
            return;
        };
        let Some(new_state) = &data.new_state else {
            debug!(key, entity_id = %data.entity_id, "Remote entity removed, keeping last value");
            return;
        };

        match StateValue::parse(variable.kind, &new_state.state) {
            Ok(value) => {
                if self.apply(variable, value, Origin::Remote) {
                    trace!(key, entity_id = %data.entity_id, "Applied remote change");
                }
            }
            Err(e) => {
                warn!(key, entity_id = %data.entity_id, error = %e, "Ignoring unparseable remote state");
            }
        }
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        for entry in self.remote_subscriptions.iter() {
            self.remote.unsubscribe(*entry.value());
        }
    }
}

/// Shared handle to a [`StateStore`]
pub type SharedStateStore = Arc<StateStore>;
