//! Change events raised by the state store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::StateValue;

/// A single change to a key in the state store
///
/// Remote changes and local writes produce the same event shape, so a
/// subscriber cannot tell where a change came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The key that changed
    pub key: String,

    /// Previous value; `None` when the key was first populated
    pub old: Option<StateValue>,

    /// The new value
    pub new: StateValue,

    /// When the change was applied to the store
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(key: impl Into<String>, old: Option<StateValue>, new: StateValue) -> Self {
        Self {
            key: key.into(),
            old,
            new,
            timestamp: Utc::now(),
        }
    }
}
