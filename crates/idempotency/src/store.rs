use async_trait::async_trait;
use messaging::EventId;

use crate::{IdempotencyRecord, Result};

/// Durable set of processed `(event_id, service_name)` pairs.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn is_processed(&self, event_id: EventId, service_name: &str) -> Result<bool>;

    /// Inserts `record` unless one already exists for the same key.
    ///
    /// Returns `true` if this call inserted it.
    async fn record_processed(&self, record: IdempotencyRecord) -> Result<bool>;

    async fn get(&self, event_id: EventId, service_name: &str)
    -> Result<Option<IdempotencyRecord>>;
}
