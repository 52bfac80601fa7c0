//! Computed state engine
//!
//! A computed key is a pure function of other keys. The engine subscribes
//! to every dependency and recomputes on each change, always from the
//! values stored at that moment. Per key, at most one recompute runs at a
//! time; a change that lands during a run causes exactly one more pass,
//! so bursts of dependency changes converge on the value their final
//! states dictate.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use ha_core::{StateValue, SubscriptionId};
use tracing::{debug, error, info, trace};

use crate::error::{ComputedError, StoreResult};
use crate::store::StateStore;

/// Pure function from dependency values (in declaration order) to the
/// derived value
pub type ComputeFn = Arc<dyn Fn(&[StateValue]) -> StateValue + Send + Sync>;

struct ComputedSpec {
    key: String,
    dependencies: Vec<String>,
    compute: ComputeFn,
    dirty: AtomicBool,
    running: AtomicBool,
}

impl ComputedSpec {
    /// Mark dirty and run passes until no change is outstanding
    fn recompute(&self, store: &StateStore) {
        self.dirty.store(true, Ordering::SeqCst);
        loop {
            if self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // The active runner will see the dirty flag
                return;
            }
            while self.dirty.swap(false, Ordering::AcqRel) {
                self.evaluate(store);
            }
            self.running.store(false, Ordering::Release);
            if !self.dirty.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn evaluate(&self, store: &StateStore) {
        let mut values = Vec::with_capacity(self.dependencies.len());
        for dependency in &self.dependencies {
            match store.get(dependency) {
                Ok(value) => values.push(value),
                Err(_) => {
                    trace!(key = %self.key, dependency = %dependency, "Dependency not yet available");
                    return;
                }
            }
        }

        let value = (self.compute)(&values);
        match store.set_computed(&self.key, value.clone()) {
            Ok(true) => debug!(key = %self.key, value = %value, "Recomputed"),
            Ok(false) => trace!(key = %self.key, "Recomputed, unchanged"),
            Err(e) => error!(key = %self.key, error = %e, "Failed to store computed value"),
        }
    }
}

/// Registers derived keys over a [`StateStore`] and keeps them current
pub struct ComputedEngine {
    store: Arc<StateStore>,
    specs: RwLock<HashMap<String, Arc<ComputedSpec>>>,
    subscriptions: RwLock<Vec<SubscriptionId>>,
}

impl ComputedEngine {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            specs: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Declare `key` as `compute(dependencies)`
    ///
    /// Both the key and its dependencies must be store variables, and the
    /// resulting dependency graph must stay acyclic. The key is computed
    /// once immediately if its dependencies are already populated.
    pub fn register<F>(&self, key: &str, dependencies: &[&str], compute: F) -> Result<(), ComputedError>
    where
        F: Fn(&[StateValue]) -> StateValue + Send + Sync + 'static,
    {
        if dependencies.is_empty() {
            return Err(ComputedError::EmptyDependencies {
                key: key.to_string(),
            });
        }
        if dependencies.contains(&key) {
            return Err(ComputedError::SelfDependency {
                key: key.to_string(),
            });
        }
        for name in std::iter::once(&key).chain(dependencies) {
            if self.store.variable(name).is_none() {
                return Err(ComputedError::UnknownKey {
                    key: name.to_string(),
                });
            }
        }

        let spec = {
            let mut specs = self.specs.write().unwrap_or_else(PoisonError::into_inner);
            if specs.contains_key(key) {
                return Err(ComputedError::AlreadyRegistered {
                    key: key.to_string(),
                });
            }
            for dependency in dependencies {
                let mut path = vec![key.to_string()];
                if reaches(&specs, dependency, key, &mut path, &mut HashSet::new()) {
                    return Err(ComputedError::Cycle { path });
                }
            }

            let spec = Arc::new(ComputedSpec {
                key: key.to_string(),
                dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
                compute: Arc::new(compute),
                dirty: AtomicBool::new(false),
                running: AtomicBool::new(false),
            });
            specs.insert(key.to_string(), spec.clone());
            spec
        };
        self.store.mark_computed(key);

        for dependency in dependencies {
            let store = Arc::downgrade(&self.store);
            let weak_spec: Weak<ComputedSpec> = Arc::downgrade(&spec);
            let id = self
                .store
                .subscribe(dependency, move |_| {
                    if let (Some(store), Some(spec)) = (store.upgrade(), weak_spec.upgrade()) {
                        spec.recompute(&store);
                    }
                })
                .map_err(|_| ComputedError::UnknownKey {
                    key: dependency.to_string(),
                })?;
            self.subscriptions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push(id);
        }

        spec.recompute(&self.store);
        info!(key, dependencies = ?dependencies, "Registered computed state");
        Ok(())
    }

    /// Declare a boolean key over boolean dependencies
    ///
    /// Dependencies that are not booleans read as false.
    pub fn register_bool<F>(&self, key: &str, dependencies: &[&str], compute: F) -> Result<(), ComputedError>
    where
        F: Fn(&[bool]) -> bool + Send + Sync + 'static,
    {
        self.register(key, dependencies, move |values| {
            let flags: Vec<bool> = values
                .iter()
                .map(|v| v.as_bool().unwrap_or(false))
                .collect();
            StateValue::Bool(compute(&flags))
        })
    }

    /// Recompute every registered key, e.g. after a resync
    pub fn recompute_all(&self) {
        let specs: Vec<Arc<ComputedSpec>> = self
            .specs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for spec in specs {
            spec.recompute(&self.store);
        }
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.specs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn dependencies(&self, key: &str) -> Option<Vec<String>> {
        self.specs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|spec| spec.dependencies.clone())
    }

    /// Current value of a computed key
    pub fn value(&self, key: &str) -> StoreResult<StateValue> {
        self.store.get(key)
    }
}

impl Drop for ComputedEngine {
    fn drop(&mut self) {
        let subscriptions = self
            .subscriptions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for id in subscriptions.drain(..) {
            self.store.unsubscribe(id);
        }
    }
}

/// Depth-first search for `target` along dependency edges
///
/// On success `path` holds the walk from the new key back to itself.
fn reaches(
    specs: &HashMap<String, Arc<ComputedSpec>>,
    from: &str,
    target: &str,
    path: &mut Vec<String>,
    seen: &mut HashSet<String>,
) -> bool {
    path.push(from.to_string());
    if from == target {
        return true;
    }
    if seen.insert(from.to_string()) {
        if let Some(spec) = specs.get(from) {
            for next in &spec.dependencies {
                if reaches(specs, next, target, path, seen) {
                    return true;
                }
            }
        }
    }
    path.pop();
    false
}
