use chrono::{DateTime, Utc};
use common::CorrelationId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::DomainEvent;

/// Schema version stamped on every envelope this crate produces.
pub const SCHEMA_VERSION: u32 = 1;

/// Unique identifier for an event. Consumers use it as the idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// The wire envelope carried by every message.
///
/// Type-specific fields are flattened into the same JSON object, so a
/// `StockReserved` message looks like:
///
/// ```text
/// {"event_id": "...", "event_type": "StockReserved", "aggregate_id": "7",
///  "aggregate_type": "Product", "version": 1, "timestamp": "...",
///  "correlation_id": "...", "product_id": 7, "quantity": 2, ...}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// The type of the event (e.g., "OrderCreated", "StockReserved").
    pub event_type: String,

    /// The aggregate this event belongs to, rendered as a string because
    /// domains key their aggregates differently.
    pub aggregate_id: String,

    /// The type of aggregate (e.g., "Order", "Cart").
    pub aggregate_type: String,

    /// Payload schema version.
    pub version: u32,

    /// When the event was created.
    pub timestamp: DateTime<Utc>,

    /// The saga this event belongs to, unchanged across every hop.
    pub correlation_id: CorrelationId,

    /// Type-specific fields.
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl EventEnvelope {
    /// Wraps a typed event in a fresh envelope.
    pub fn wrap<E: DomainEvent>(
        correlation_id: CorrelationId,
        event: &E,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::builder()
            .event_type(E::EVENT_TYPE)
            .aggregate_id(event.aggregate_id())
            .aggregate_type(E::AGGREGATE_TYPE)
            .correlation_id(correlation_id)
            .payload(event)?
            .build())
    }

    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Decodes the type-specific fields into `E`.
    pub fn decode<E: DomainEvent>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(self.payload.clone()))
    }

    /// Serializes the envelope for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses an envelope from the wire.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    event_type: Option<String>,
    aggregate_id: Option<String>,
    aggregate_type: Option<String>,
    version: Option<u32>,
    timestamp: Option<DateTime<Utc>>,
    correlation_id: Option<CorrelationId>,
    payload: serde_json::Map<String, serde_json::Value>,
}

impl EventEnvelopeBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the aggregate ID.
    pub fn aggregate_id(mut self, id: impl Into<String>) -> Self {
        self.aggregate_id = Some(id.into());
        self
    }

    /// Sets the aggregate type.
    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    /// Sets the schema version. Defaults to [`SCHEMA_VERSION`].
    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the correlation ID. If not set, a new one is minted.
    pub fn correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Sets the payload from a serializable struct.
    ///
    /// Fails if the value does not serialize to a JSON object.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(payload)? {
            serde_json::Value::Object(map) => {
                self.payload = map;
                Ok(self)
            }
            other => Err(serde::ser::Error::custom(format!(
                "event payload must be a JSON object, got {other}"
            ))),
        }
    }

    /// Sets a single raw payload field.
    pub fn field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Tries to build the event envelope, returning None if required fields are missing.
    pub fn try_build(self) -> Option<EventEnvelope> {
        Some(EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self.event_type?,
            aggregate_id: self.aggregate_id?,
            aggregate_type: self.aggregate_type?,
            version: self.version.unwrap_or(SCHEMA_VERSION),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            correlation_id: self.correlation_id.unwrap_or_default(),
            payload: self.payload,
        })
    }

    /// Builds the event envelope, filling unset required fields with
    /// `"unknown"` so a malformed producer still yields a routable message.
    pub fn build(self) -> EventEnvelope {
        EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self.event_type.unwrap_or_else(|| "unknown".to_string()),
            aggregate_id: self.aggregate_id.unwrap_or_else(|| "unknown".to_string()),
            aggregate_type: self
                .aggregate_type
                .unwrap_or_else(|| "unknown".to_string()),
            version: self.version.unwrap_or(SCHEMA_VERSION),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            correlation_id: self.correlation_id.unwrap_or_default(),
            payload: self.payload,
        }
    }
}
