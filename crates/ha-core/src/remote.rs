//! The seam between the state store and the transport session

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{RemoteResult, State, StateChangedData};

/// Identifies exactly one subscription, independent of any other
/// subscription on the same key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Callback for remote entity changes
pub type RemoteChangeHandler = Arc<dyn Fn(&StateChangedData) + Send + Sync>;

/// A remote event/state source the store mirrors
///
/// Implemented by the WebSocket client; tests substitute an in-memory
/// double.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Bulk read of every remote entity
    async fn get_all_states(&self) -> RemoteResult<Vec<State>>;

    /// Invoke a remote service (used for write-backs)
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: serde_json::Value,
    ) -> RemoteResult<()>;

    /// Register interest in one entity's changes
    ///
    /// Registrations outlive individual sessions.
    fn subscribe_state_changes(&self, entity_id: &str, handler: RemoteChangeHandler)
        -> SubscriptionId;

    /// Remove exactly one registration; returns false if it was already gone
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    fn is_connected(&self) -> bool;

    /// Resolve once a session is established and reported connected
    async fn wait_connected(&self);
}
