//! State variable definitions
//!
//! Every key the store tracks is declared up front with its type, its
//! backing remote entity and how it may be written.

use ha_core::{EntityId, StateValue, ValueKind};
use serde_json::json;

/// Metadata for one tracked key
#[derive(Debug, Clone, PartialEq)]
pub struct StateVariable {
    /// Logical key plugins use, e.g. `isNickHome`
    pub key: String,
    /// Backing remote entity; `None` for local-only variables
    pub entity_id: Option<EntityId>,
    pub kind: ValueKind,
    /// Used when the remote entity is missing or its state is unparseable
    pub default: StateValue,
    /// Never writable by plugins
    pub read_only: bool,
    /// Lives only in the store and is never written back
    pub local_only: bool,
    /// Produced by the computed state engine; still written back in
    /// read-only mode
    pub computed_output: bool,
}

impl StateVariable {
    fn remote(key: &str, entity_id: &str, default: StateValue) -> Self {
        Self {
            key: key.to_string(),
            entity_id: entity_id.parse().ok(),
            kind: default.kind(),
            default,
            read_only: false,
            local_only: false,
            computed_output: false,
        }
    }

    pub fn boolean(key: &str, entity_id: &str, default: bool) -> Self {
        Self::remote(key, entity_id, StateValue::Bool(default))
    }

    pub fn number(key: &str, entity_id: &str, default: f64) -> Self {
        Self::remote(key, entity_id, StateValue::Number(default))
    }

    pub fn text(key: &str, entity_id: &str, default: &str) -> Self {
        Self::remote(key, entity_id, StateValue::String(default.to_string()))
    }

    pub fn structured(key: &str, entity_id: &str, default: serde_json::Value) -> Self {
        Self::remote(key, entity_id, StateValue::Structured(default))
    }

    /// A variable that exists only in the store
    pub fn local(key: &str, default: StateValue) -> Self {
        Self {
            key: key.to_string(),
            entity_id: None,
            kind: default.kind(),
            default,
            read_only: false,
            local_only: true,
            computed_output: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn computed_output(mut self) -> Self {
        self.computed_output = true;
        self
    }

    /// Whether writes to this variable are mirrored to the remote source
    pub fn is_remote(&self) -> bool {
        !self.local_only && self.entity_id.is_some()
    }
}

/// The home automation variables: presence, sleep, media, energy, day
/// phase, and the local-only music state
pub fn default_variables() -> Vec<StateVariable> {
    use StateVariable as V;

    vec![
        // Presence
        V::boolean("isNickHome", "input_boolean.nick_home", false),
        V::boolean("isCarolineHome", "input_boolean.caroline_home", false),
        V::boolean("isToriHere", "input_boolean.tori_here", false),
        V::boolean("isAnyOwnerHome", "input_boolean.any_owner_home", false).computed_output(),
        V::boolean("isAnyoneHome", "input_boolean.anyone_home", false).computed_output(),
        V::boolean("isHaveGuests", "input_boolean.have_guests", false),
        V::boolean("isExpectingSomeone", "input_boolean.expecting_someone", false),
        // Sleep
        V::boolean("isMasterAsleep", "input_boolean.master_asleep", false),
        V::boolean("isGuestAsleep", "input_boolean.guest_asleep", false),
        V::boolean("isAnyoneAsleep", "input_boolean.anyone_asleep", false).computed_output(),
        V::boolean("isEveryoneAsleep", "input_boolean.everyone_asleep", false).computed_output(),
        V::boolean(
            "isAnyoneHomeAndAwake",
            "input_boolean.anyone_home_and_awake",
            false,
        )
        .computed_output(),
        V::boolean("isGuestBedroomDoorOpen", "input_boolean.guest_bedroom_door_open", false),
        // Media
        V::boolean("isAppleTVPlaying", "input_boolean.apple_tv_playing", false),
        V::boolean("isTVPlaying", "input_boolean.tv_playing", false),
        V::boolean("isTVon", "input_boolean.tv_on", false),
        V::boolean("isFadeOutInProgress", "input_boolean.fade_out_in_progress", false),
        V::text("musicPlaybackType", "input_text.music_playback_type", ""),
        // Energy
        V::boolean("isFreeEnergyAvailable", "input_boolean.free_energy_available", false),
        V::boolean("isGridAvailable", "input_boolean.grid_available", true),
        V::number("remainingSolarGeneration", "input_number.remaining_solar_generation", 0.0),
        V::number("thisHourSolarGeneration", "input_number.this_hour_solar_generation", 0.0),
        V::text("batteryEnergyLevel", "input_text.battery_energy_level", ""),
        V::text("currentEnergyLevel", "input_text.current_energy_level", ""),
        V::text(
            "solarProductionEnergyLevel",
            "input_text.solar_production_energy_level",
            "",
        ),
        // Schedule and day phase
        V::number("alarmTime", "input_number.alarm_time", 0.0),
        V::text("dayPhase", "input_text.day_phase", ""),
        V::text("sunevent", "input_text.sun_event", ""),
        // Local only
        V::local("currentlyPlayingMusic", StateValue::Structured(json!({}))),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_default_registry_is_consistent() {
        let vars = default_variables();
        assert_eq!(vars.len(), 29);

        let keys: HashSet<_> = vars.iter().map(|v| v.key.as_str()).collect();
        assert_eq!(keys.len(), vars.len(), "duplicate key");

        for v in &vars {
            assert_eq!(v.kind, v.default.kind(), "{}", v.key);
            if v.local_only {
                assert!(v.entity_id.is_none());
            } else {
                let entity = v.entity_id.as_ref().expect("remote variable needs an entity");
                let expected_domain = match v.kind {
                    ValueKind::Bool => "input_boolean",
                    ValueKind::Number => "input_number",
                    _ => "input_text",
                };
                assert_eq!(entity.domain(), expected_domain, "{}", v.key);
            }
        }
    }

    #[test]
    fn test_grid_defaults_available() {
        let grid = default_variables()
            .into_iter()
            .find(|v| v.key == "isGridAvailable")
            .unwrap();
        assert_eq!(grid.default, StateValue::Bool(true));
    }

    #[test]
    fn test_local_variable_is_not_remote() {
        let music = StateVariable::local("currentlyPlayingMusic", StateValue::Structured(json!({})));
        assert!(!music.is_remote());
        assert!(StateVariable::boolean("x", "input_boolean.x", false).is_remote());
    }
}
