//! Entity ID type representing a domain.object_id pair

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for invalid entity IDs
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EntityIdError {
    #[error("entity_id must contain exactly one '.' separator")]
    InvalidFormat,

    #[error("domain cannot be empty")]
    EmptyDomain,

    #[error("object_id cannot be empty")]
    EmptyObjectId,

    #[error("'{0}' contains characters other than lowercase alphanumerics and underscores")]
    InvalidChars(String),
}

/// A remote entity ID (e.g., "input_boolean.nick_home")
///
/// The domain selects which helper service family a write-back goes
/// through; the object_id is the entity's name within that domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    domain: String,
    object_id: String,
}

impl EntityId {
    /// Create a new EntityId from domain and object_id parts
    pub fn new(
        domain: impl Into<String>,
        object_id: impl Into<String>,
    ) -> Result<Self, EntityIdError> {
        let domain = domain.into();
        let object_id = object_id.into();

        if domain.is_empty() {
            return Err(EntityIdError::EmptyDomain);
        }
        if object_id.is_empty() {
            return Err(EntityIdError::EmptyObjectId);
        }
        for part in [&domain, &object_id] {
            if !is_valid_part(part) {
                return Err(EntityIdError::InvalidChars(part.clone()));
            }
        }

        Ok(Self { domain, object_id })
    }

    /// The domain part, e.g. `input_boolean`
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The object_id part, e.g. `nick_home`
    pub fn object_id(&self) -> &str {
        &self.object_id
    }
}

fn is_valid_part(s: &str) -> bool {
    !s.starts_with('_')
        && !s.ends_with('_')
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl FromStr for EntityId {
    type Err = EntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((domain, object_id)) if !object_id.contains('.') => Self::new(domain, object_id),
            _ => Err(EntityIdError::InvalidFormat),
        }
    }
}

impl TryFrom<String> for EntityId {
    type Error = EntityIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> String {
        id.to_string()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain, self.object_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entity_id() {
        let id: EntityId = "input_boolean.nick_home".parse().unwrap();
        assert_eq!(id.domain(), "input_boolean");
        assert_eq!(id.object_id(), "nick_home");
        assert_eq!(id.to_string(), "input_boolean.nick_home");
    }

    #[test]
    fn test_invalid_format() {
        assert_eq!(
            "no_separator".parse::<EntityId>().unwrap_err(),
            EntityIdError::InvalidFormat
        );
        assert_eq!(
            "too.many.parts".parse::<EntityId>().unwrap_err(),
            EntityIdError::InvalidFormat
        );
    }

    #[test]
    fn test_empty_parts() {
        assert_eq!(
            ".object".parse::<EntityId>().unwrap_err(),
            EntityIdError::EmptyDomain
        );
        assert_eq!(
            "domain.".parse::<EntityId>().unwrap_err(),
            EntityIdError::EmptyObjectId
        );
    }

    #[test]
    fn test_invalid_chars() {
        assert!(matches!(
            "Input_Boolean.x".parse::<EntityId>(),
            Err(EntityIdError::InvalidChars(_))
        ));
        assert!(matches!(
            "input_text.day-phase".parse::<EntityId>(),
            Err(EntityIdError::InvalidChars(_))
        ));
        assert!(matches!(
            "input_text._hidden".parse::<EntityId>(),
            Err(EntityIdError::InvalidChars(_))
        ));
    }

    #[test]
    fn test_serde_roundtrip_as_string() {
        let id: EntityId = serde_json::from_str("\"input_number.alarm_time\"").unwrap();
        assert_eq!(id.object_id(), "alarm_time");
        assert_eq!(
            serde_json::to_string(&id).unwrap(),
            "\"input_number.alarm_time\""
        );
    }
}
