//! Standard derived states of the home
//!
//! Presence and sleep roll-ups that every plugin reads instead of
//! recombining the individual flags.

use tracing::info;

use crate::computed::ComputedEngine;
use crate::error::ComputedError;

/// Derived keys in dependency order
pub const DERIVED_KEYS: [&str; 5] = [
    "isAnyOwnerHome",
    "isAnyoneHome",
    "isAnyoneAsleep",
    "isEveryoneAsleep",
    "isAnyoneHomeAndAwake",
];

/// Register the presence and sleep roll-ups
pub fn register_standard(engine: &ComputedEngine) -> Result<(), ComputedError> {
    engine.register_bool("isAnyOwnerHome", &["isNickHome", "isCarolineHome"], |v| {
        v[0] || v[1]
    })?;
    engine.register_bool("isAnyoneHome", &["isAnyOwnerHome", "isToriHere"], |v| {
        v[0] || v[1]
    })?;
    engine.register_bool("isAnyoneAsleep", &["isMasterAsleep", "isGuestAsleep"], |v| {
        v[0] || v[1]
    })?;
    engine.register_bool("isEveryoneAsleep", &["isMasterAsleep", "isGuestAsleep"], |v| {
        v[0] && v[1]
    })?;
    engine.register_bool(
        "isAnyoneHomeAndAwake",
        &["isAnyoneHome", "isAnyoneAsleep"],
        |v| v[0] && !v[1],
    )?;

    info!(variables = ?DERIVED_KEYS, "Derived states registered");
    Ok(())
}
