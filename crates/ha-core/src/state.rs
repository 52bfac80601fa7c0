//! Remote entity state as carried on the wire

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The state of a remote entity at a point in time
///
/// The state value is always a string on the wire ("on", "off", "23.5",
/// "unavailable"); the store converts it into a typed value according to
/// the variable it backs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    /// The entity this state belongs to
    pub entity_id: String,

    /// The raw state value
    pub state: String,

    /// Additional attributes associated with the state
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    /// When the state value last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed: Option<DateTime<Utc>>,

    /// When the state was last written, even if the value didn't change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,

    /// Context of the change that produced this state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
}

impl State {
    /// Create a state stamped with the current time
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes: HashMap::new(),
            last_changed: Some(now),
            last_updated: Some(now),
            context: None,
        }
    }

    /// Check if the state value represents an unavailable entity
    pub fn is_unavailable(&self) -> bool {
        self.state == "unavailable"
    }

    /// Get an attribute value by key
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps and context are not compared
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}

/// Origin and causality of a remote state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Payload of a remote `state_changed` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangedData {
    pub entity_id: String,
    #[serde(default)]
    pub old_state: Option<State>,
    #[serde(default)]
    pub new_state: Option<State>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_wire_state() {
        let state: State = serde_json::from_value(json!({
            "entity_id": "input_boolean.nick_home",
            "state": "on",
            "attributes": {"friendly_name": "Nick Home"},
            "last_changed": "2026-01-07T10:00:00Z",
            "last_updated": "2026-01-07T10:00:00Z",
            "context": {"id": "01HXYZ", "parent_id": null, "user_id": null}
        }))
        .unwrap();

        assert_eq!(state.state, "on");
        assert_eq!(
            state.attribute::<String>("friendly_name").as_deref(),
            Some("Nick Home")
        );
        assert_eq!(state.context.unwrap().id, "01HXYZ");
    }

    #[test]
    fn test_state_changed_without_old_state() {
        let data: StateChangedData = serde_json::from_value(json!({
            "entity_id": "input_text.day_phase",
            "new_state": {"entity_id": "input_text.day_phase", "state": "morning"}
        }))
        .unwrap();

        assert!(data.old_state.is_none());
        assert_eq!(data.new_state.unwrap().state, "morning");
    }
}
