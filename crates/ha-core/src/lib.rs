//! Core types for the entity state synchronization layer
//!
//! This crate provides the types shared by the transport session, the
//! subscription multiplexer and the state store: remote wire types
//! ([`State`], [`StateChangedData`]), typed store values ([`StateValue`]),
//! change notifications ([`ChangeEvent`]), the [`RemoteSource`] seam, and
//! cancellable scheduled tasks.

mod change;
mod entity_id;
mod error;
mod remote;
pub mod schedule;
mod state;
mod value;

pub use change::ChangeEvent;
pub use entity_id::{EntityId, EntityIdError};
pub use error::{RemoteError, RemoteResult};
pub use remote::{RemoteChangeHandler, RemoteSource, SubscriptionId};
pub use schedule::{ManualScheduler, Scheduler, TaskHandle, TokioScheduler};
pub use state::{Context, State, StateChangedData};
pub use value::{StateValue, ValueKind, ValueParseError};

/// Standard event types on the remote wire
pub mod events {
    /// Event type for state changes
    pub const STATE_CHANGED: &str = "state_changed";
}
