//! Typed entity state store for the home automation core
//!
//! This crate provides:
//! - [`StateStore`]: a concurrent map of typed values mirrored from the
//!   remote source, with per-key subscriptions, compare-and-swap and
//!   ordered write-back of local changes
//! - [`ComputedEngine`]: derived keys recomputed from their dependencies
//! - the default variable registry and the standard derived states

mod computed;
pub mod derived;
mod error;
mod store;
pub mod variables;
mod writer;

pub use computed::{ComputeFn, ComputedEngine};
pub use error::{ComputedError, StoreError, StoreResult};
pub use store::{SharedStateStore, StateStore, SyncSummary};
pub use variables::{default_variables, StateVariable};
pub use writer::service_call;
