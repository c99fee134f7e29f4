use chrono::{DateTime, Utc};
use messaging::EventId;
use serde::{Deserialize, Serialize};

/// Proof that `service_name` finished processing `event_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub event_id: EventId,
    pub service_name: String,
    /// The handler that ran, e.g. `reserve_stock`.
    pub action: String,
    /// Short outcome tag, e.g. `reserved` or `ignored`.
    pub result: String,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn new(
        event_id: EventId,
        service_name: impl Into<String>,
        action: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            event_id,
            service_name: service_name.into(),
            action: action.into(),
            result: result.into(),
            created_at: Utc::now(),
        }
    }
}
