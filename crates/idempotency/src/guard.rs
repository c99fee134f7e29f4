use std::sync::Arc;

use messaging::EventId;

use crate::{IdempotencyRecord, IdempotencyStore, Result};

/// A service's view of the idempotency store.
///
/// Call [`is_processed`](Self::is_processed) before any side effect and
/// [`record_processed`](Self::record_processed) after the last one.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    service_name: String,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, service_name: impl Into<String>) -> Self {
        Self {
            store,
            service_name: service_name.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub async fn is_processed(&self, event_id: EventId) -> Result<bool> {
        self.store.is_processed(event_id, &self.service_name).await
    }

    /// Returns `false` if a concurrent delivery recorded the event first.
    pub async fn record_processed(
        &self,
        event_id: EventId,
        action: &str,
        result: &str,
    ) -> Result<bool> {
        self.store
            .record_processed(IdempotencyRecord::new(
                event_id,
                self.service_name.clone(),
                action,
                result,
            ))
            .await
    }
}
