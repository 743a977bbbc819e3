//! The event record and its wire envelope.
//!
//! An [`Event`] is built with consuming builder methods and is never mutated
//! once it has been handed to a bus. Crossing a process boundary it travels
//! as an [`EventEnvelope`]: flat string fields plus a JSON-encoded payload.

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::fmt;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::ids::Address;

/// Open payload of named JSON fields
pub type Payload = Map<String, Value>;

/// Unique event identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoreError::MalformedEnvelope(format!("event id '{s}': {e}")))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag selecting the handlers an event is delivered to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventKind(Cow<'static, str>);

impl EventKind {
    /// Read request against an agent profile or the environment
    pub const DATA_REQUEST: EventKind = EventKind::from_static("DataEvent");
    /// Answer to a [`EventKind::DATA_REQUEST`]
    pub const DATA_RESPONSE: EventKind = EventKind::from_static("DataResponseEvent");
    /// Write request against an agent profile or the environment
    pub const DATA_UPDATE: EventKind = EventKind::from_static("DataUpdateEvent");
    /// Answer to a [`EventKind::DATA_UPDATE`]
    pub const DATA_UPDATE_RESPONSE: EventKind = EventKind::from_static("DataUpdateResponseEvent");
    /// Stops the addressed agents (or the environment)
    pub const TERMINATION: EventKind = EventKind::from_static("TerminationEvent");
    pub const PAUSE: EventKind = EventKind::from_static("PauseEvent");
    pub const RESUME: EventKind = EventKind::from_static("ResumeEvent");
    /// Trigger fired by the environment at each round or step
    pub const START: EventKind = EventKind::from_static("StartEvent");
    /// Agent's report that it finished the current round
    pub const END: EventKind = EventKind::from_static("EndEvent");
    /// Agent decision forwarded to the environment for persistence
    pub const DECISION: EventKind = EventKind::from_static("DecisionEvent");

    pub const fn from_static(kind: &'static str) -> Self {
        Self(Cow::Borrowed(kind))
    }

    pub fn new(kind: impl Into<String>) -> Self {
        Self(Cow::Owned(kind.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Kinds handled by the runtime itself; business handlers may not claim them.
    pub fn is_infrastructure(&self) -> bool {
        [
            Self::DATA_REQUEST,
            Self::DATA_RESPONSE,
            Self::DATA_UPDATE,
            Self::DATA_UPDATE_RESPONSE,
            Self::TERMINATION,
        ]
        .iter()
        .any(|k| k == self)
    }
}

impl From<&'static str> for EventKind {
    fn from(kind: &'static str) -> Self {
        Self::from_static(kind)
    }
}

impl From<String> for EventKind {
    fn from(kind: String) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable message exchanged between agents and the environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    kind: EventKind,
    from: Address,
    to: Address,
    parent_id: Option<EventId>,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    payload: Payload,
}

impl Event {
    pub fn new(kind: impl Into<EventKind>, from: Address, to: Address) -> Self {
        Self {
            id: EventId::new(),
            kind: kind.into(),
            from,
            to,
            parent_id: None,
            timestamp: Utc::now(),
            payload: Payload::new(),
        }
    }

    /// Attach a named payload field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Replace the payload with the fields of a serializable struct
    pub fn with_body<T: Serialize>(mut self, body: &T) -> CoreResult<Self> {
        match serde_json::to_value(body)? {
            Value::Object(map) => {
                self.payload = map;
                Ok(self)
            }
            other => Err(CoreError::invalid_payload(
                self.kind.as_str(),
                format!("payload must be a JSON object, got {other}"),
            )),
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Record the event that caused this one
    pub fn with_parent(mut self, parent: EventId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn with_sender(mut self, from: Address) -> Self {
        self.from = from;
        self
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn from(&self) -> &Address {
        &self.from
    }

    pub fn to(&self) -> &Address {
        &self.to
    }

    pub fn parent_id(&self) -> Option<EventId> {
        self.parent_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn is(&self, kind: &EventKind) -> bool {
        &self.kind == kind
    }

    /// Decode the payload into a typed body
    pub fn body<T: DeserializeOwned>(&self) -> CoreResult<T> {
        serde_json::from_value(Value::Object(self.payload.clone()))
            .map_err(|e| CoreError::invalid_payload(self.kind.as_str(), e.to_string()))
    }
}

/// Kind-tagged wire form of an [`Event`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub event_kind: String,
    pub from_agent_id: String,
    pub to_agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<String>,
    pub timestamp_ms: i64,
    pub payload_json: String,
}

impl From<&Event> for EventEnvelope {
    fn from(event: &Event) -> Self {
        Self {
            event_id: event.id.to_string(),
            event_kind: event.kind.to_string(),
            from_agent_id: event.from.to_string(),
            to_agent_id: event.to.to_string(),
            parent_event_id: event.parent_id.map(|p| p.to_string()),
            timestamp_ms: event.timestamp.timestamp_millis(),
            // a Map always serializes
            payload_json: Value::Object(event.payload.clone()).to_string(),
        }
    }
}

impl TryFrom<EventEnvelope> for Event {
    type Error = CoreError;

    fn try_from(envelope: EventEnvelope) -> Result<Self, Self::Error> {
        let from = Address::parse(&envelope.from_agent_id)
            .map_err(|e| CoreError::invalid_id(&envelope.from_agent_id, e))?;
        let to = Address::parse(&envelope.to_agent_id)
            .map_err(|e| CoreError::invalid_id(&envelope.to_agent_id, e))?;
        let parent_id = envelope
            .parent_event_id
            .as_deref()
            .map(EventId::parse)
            .transpose()?;
        let timestamp = Utc
            .timestamp_millis_opt(envelope.timestamp_ms)
            .single()
            .ok_or_else(|| {
                CoreError::MalformedEnvelope(format!(
                    "timestamp out of range: {}",
                    envelope.timestamp_ms
                ))
            })?;
        let payload = match serde_json::from_str::<Value>(&envelope.payload_json)? {
            Value::Object(map) => map,
            Value::Null => Payload::new(),
            other => {
                return Err(CoreError::MalformedEnvelope(format!(
                    "payload must be a JSON object, got {other}"
                )));
            }
        };
        if envelope.event_kind.is_empty() {
            return Err(CoreError::MalformedEnvelope("empty event kind".into()));
        }

        Ok(Self {
            id: EventId::parse(&envelope.event_id)?,
            kind: EventKind::new(envelope.event_kind),
            from,
            to,
            parent_id,
            timestamp,
            payload,
        })
    }
}
