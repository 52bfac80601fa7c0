//! WebSocket message types
//!
//! Defines the outgoing requests and incoming messages of the remote
//! protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Outgoing Messages
// =============================================================================

/// First message on every connection, answering `auth_required`
#[derive(Debug, Serialize)]
pub struct AuthMessage<'a> {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub access_token: &'a str,
}

impl<'a> AuthMessage<'a> {
    pub fn new(access_token: &'a str) -> Self {
        Self {
            msg_type: "auth",
            access_token,
        }
    }
}

/// An outbound request; the session stamps it with the next message ID
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    SubscribeEvents {
        #[serde(skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
    },
    UnsubscribeEvents {
        subscription: u64,
    },
    GetStates,
    CallService {
        domain: String,
        service: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        service_data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<ServiceTarget>,
    },
    Ping,
}

impl Request {
    pub fn call_service(
        domain: impl Into<String>,
        service: impl Into<String>,
        service_data: Value,
    ) -> Self {
        Request::CallService {
            domain: domain.into(),
            service: service.into(),
            service_data: Some(service_data),
            target: None,
        }
    }

    /// Wire form with the message ID attached
    pub fn to_frame(&self, id: u64) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert("id".to_string(), Value::from(id));
        }
        serde_json::to_string(&value)
    }

    /// Message type name, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Request::SubscribeEvents { .. } => "subscribe_events",
            Request::UnsubscribeEvents { .. } => "unsubscribe_events",
            Request::GetStates => "get_states",
            Request::CallService { .. } => "call_service",
            Request::Ping => "ping",
        }
    }
}

/// Target for service calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTarget {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entity_id: Vec<String>,
}

// =============================================================================
// Incoming Messages
// =============================================================================

/// Incoming WebSocket message from the remote source
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingMessage {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<ErrorPayload>,
    },
    Event {
        id: u64,
        event: EventPayload,
    },
    Pong {
        id: u64,
    },
    #[serde(other)]
    Unknown,
}

/// Error details in a failed result
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Unsolicited event carried by an `event` message
#[derive(Debug, Clone, Deserialize)]
pub struct EventPayload {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub time_fired: Option<DateTime<Utc>>,
}
