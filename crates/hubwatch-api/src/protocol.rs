//! Wire frames for the hub's real-time API.
//!
//! Every frame is a JSON object discriminated by its `type` field. Frames
//! flowing from the hub are decoded into [`ServerFrame`]; frames we send are
//! built from [`Command`] (request/response traffic, always carrying an `id`)
//! or [`AuthFrame`] (the one id-less frame of the handshake).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event type carrying entity state transitions.
pub const STATE_CHANGED: &str = "state_changed";

// ── Outbound ─────────────────────────────────────────────────────────

/// First frame we send, in answer to `auth_required`.
#[derive(Debug, Serialize)]
pub struct AuthFrame<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub access_token: &'a str,
}

impl<'a> AuthFrame<'a> {
    pub fn new(access_token: &'a str) -> Self {
        Self {
            kind: "auth",
            access_token,
        }
    }
}

/// Target selector for a service call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceTarget {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entity_id: Vec<String>,
}

impl ServiceTarget {
    pub fn entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: vec![entity_id.into()],
        }
    }
}

/// A domain-level service invocation (`light.turn_on`, `switch.toggle`, ...).
///
/// What the service *means* is the hub's business; we only carry it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub service_data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ServiceTarget>,
}

impl ServiceCall {
    pub fn new(domain: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            service_data: Map::new(),
            target: None,
        }
    }

    #[must_use]
    pub fn with_target(mut self, entity_id: impl Into<String>) -> Self {
        self.target = Some(ServiceTarget::entity(entity_id));
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.service_data.insert(key.into(), value.into());
        self
    }
}

/// Every id-carrying request the client can send.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    CallService(ServiceCall),
    SubscribeEvents {
        #[serde(skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
    },
    UnsubscribeEvents {
        subscription: u64,
    },
    Ping,
}

impl Command {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CallService(_) => "call_service",
            Self::SubscribeEvents { .. } => "subscribe_events",
            Self::UnsubscribeEvents { .. } => "unsubscribe_events",
            Self::Ping => "ping",
        }
    }
}

/// A [`Command`] stamped with its correlation id, ready for the wire.
#[derive(Debug, Serialize)]
pub struct OutboundFrame<'a> {
    pub id: u64,
    #[serde(flatten)]
    pub command: &'a Command,
}

// ── Inbound ──────────────────────────────────────────────────────────

/// Error envelope carried by a failed `result` frame.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Every frame the hub can send us.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
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
        error: Option<ErrorDetail>,
    },
    Event {
        id: u64,
        event: HubEvent,
    },
    Pong {
        id: u64,
    },
}

impl ServerFrame {
    /// Decode one text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthRequired { .. } => "auth_required",
            Self::AuthOk { .. } => "auth_ok",
            Self::AuthInvalid { .. } => "auth_invalid",
            Self::Result { .. } => "result",
            Self::Event { .. } => "event",
            Self::Pong { .. } => "pong",
        }
    }
}

/// An event delivered through a subscription.
///
/// `data` is kept raw; typed views such as [`StateChange`] are decoded on
/// demand so unknown event types pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubEvent {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub time_fired: Option<String>,
}

impl HubEvent {
    /// Decode a `state_changed` payload.
    ///
    /// Returns `None` for other event types and for entity removals
    /// (`new_state: null`), which carry no state to verify against.
    pub fn state_change(&self) -> Option<StateChange> {
        if self.event_type != STATE_CHANGED {
            return None;
        }
        let payload: StateChangedData = serde_json::from_value(self.data.clone()).ok()?;
        let new_state = payload.new_state?;
        Some(StateChange {
            target_id: payload.entity_id,
            new_state: new_state.state,
            attributes: new_state.attributes,
        })
    }
}

#[derive(Debug, Deserialize)]
struct StateChangedData {
    entity_id: String,
    #[serde(default)]
    new_state: Option<EntityState>,
}

#[derive(Debug, Deserialize)]
struct EntityState {
    state: String,
    #[serde(default)]
    attributes: Map<String, Value>,
}

/// The verification-relevant slice of a `state_changed` event.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub target_id: String,
    pub new_state: String,
    pub attributes: Map<String, Value>,
}
