//! Typed values held by the state store

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The type tag of a [`StateValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Bool,
    Number,
    String,
    Structured,
}

impl ValueKind {
    /// Precedence used by type-inferring reads: bool, then string, then number.
    ///
    /// Plugins rely on this order for keys that have been typed differently
    /// over time, so it must not be reordered. Structured values are never
    /// inferred.
    pub const INFERENCE_ORDER: [ValueKind; 3] =
        [ValueKind::Bool, ValueKind::String, ValueKind::Number];

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Structured => "structured",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error converting a remote state string into a typed value
#[derive(Debug, Clone, Error, PartialEq)]
#[error("cannot parse '{raw}' as {kind}")]
pub struct ValueParseError {
    pub kind: ValueKind,
    pub raw: String,
}

/// A value in the state store
///
/// A set always replaces the whole value; there is no partial update of a
/// structured document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum StateValue {
    Bool(bool),
    Number(f64),
    String(String),
    Structured(serde_json::Value),
}

impl StateValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            StateValue::Bool(_) => ValueKind::Bool,
            StateValue::Number(_) => ValueKind::Number,
            StateValue::String(_) => ValueKind::String,
            StateValue::Structured(_) => ValueKind::Structured,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            StateValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_structured(&self) -> Option<&serde_json::Value> {
        match self {
            StateValue::Structured(v) => Some(v),
            _ => None,
        }
    }

    /// Parse a remote state string into a value of the given kind
    ///
    /// Booleans are `true` only for `"on"`. Structured values fall back to
    /// an empty object when the remote text is not valid JSON, since helper
    /// text entities start out empty.
    pub fn parse(kind: ValueKind, raw: &str) -> Result<Self, ValueParseError> {
        match kind {
            ValueKind::Bool => Ok(StateValue::Bool(raw == "on")),
            ValueKind::Number => raw
                .trim()
                .parse::<f64>()
                .map(StateValue::Number)
                .map_err(|_| ValueParseError {
                    kind,
                    raw: raw.to_string(),
                }),
            ValueKind::String => Ok(StateValue::String(raw.to_string())),
            ValueKind::Structured => Ok(StateValue::Structured(
                serde_json::from_str(raw)
                    .unwrap_or_else(|_| serde_json::Value::Object(Default::default())),
            )),
        }
    }

    /// The value as the remote source represents it in a state string
    pub fn to_remote_string(&self) -> String {
        match self {
            StateValue::Bool(true) => "on".to_string(),
            StateValue::Bool(false) => "off".to_string(),
            StateValue::Number(n) => n.to_string(),
            StateValue::String(s) => s.clone(),
            StateValue::Structured(v) => v.to_string(),
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_remote_string())
    }
}

impl From<bool> for StateValue {
    fn from(b: bool) -> Self {
        StateValue::Bool(b)
    }
}

impl From<f64> for StateValue {
    fn from(n: f64) -> Self {
        StateValue::Number(n)
    }
}

impl From<String> for StateValue {
    fn from(s: String) -> Self {
        StateValue::String(s)
    }
}

impl From<&str> for StateValue {
    fn from(s: &str) -> Self {
        StateValue::String(s.to_string())
    }
}

impl From<serde_json::Value> for StateValue {
    fn from(v: serde_json::Value) -> Self {
        StateValue::Structured(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_parse_bool_only_on_is_true() {
        assert_eq!(
            assert_ok!(StateValue::parse(ValueKind::Bool, "on")),
            StateValue::Bool(true)
        );
        for raw in ["off", "unavailable", "unknown", "true", ""] {
            assert_eq!(
                StateValue::parse(ValueKind::Bool, raw).unwrap(),
                StateValue::Bool(false),
                "{raw}"
            );
        }
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(
            assert_ok!(StateValue::parse(ValueKind::Number, "23.5")),
            StateValue::Number(23.5)
        );
        let err = assert_err!(StateValue::parse(ValueKind::Number, "unavailable"));
        assert_eq!(err.kind, ValueKind::Number);
    }

    #[test]
    fn test_parse_structured_falls_back_to_empty_object() {
        assert_eq!(
            StateValue::parse(ValueKind::Structured, r#"{"type":"wakeup"}"#).unwrap(),
            StateValue::Structured(json!({"type": "wakeup"}))
        );
        assert_eq!(
            StateValue::parse(ValueKind::Structured, "not json").unwrap(),
            StateValue::Structured(json!({}))
        );
    }

    #[test]
    fn test_remote_string() {
        assert_eq!(StateValue::Bool(true).to_remote_string(), "on");
        assert_eq!(StateValue::Bool(false).to_remote_string(), "off");
        assert_eq!(StateValue::Number(7.0).to_remote_string(), "7");
        assert_eq!(
            StateValue::Structured(json!({"a": 1})).to_remote_string(),
            r#"{"a":1}"#
        );
    }

    #[test]
    fn test_inference_order_is_bool_string_number() {
        assert_eq!(
            ValueKind::INFERENCE_ORDER,
            [ValueKind::Bool, ValueKind::String, ValueKind::Number]
        );
    }
}
