use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use messaging::EventId;
use tokio::sync::RwLock;

use crate::{IdempotencyRecord, IdempotencyStore, Result};

/// In-memory idempotency store for tests and single-process runs.
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    records: Arc<RwLock<HashMap<(EventId, String), IdempotencyRecord>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records across all services.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn is_processed(&self, event_id: EventId, service_name: &str) -> Result<bool> {
        Ok(self
            .records
            .read()
            .await
            .contains_key(&(event_id, service_name.to_string())))
    }

    async fn record_processed(&self, record: IdempotencyRecord) -> Result<bool> {
        let key = (record.event_id, record.service_name.clone());
        let mut records = self.records.write().await;
        if records.contains_key(&key) {
            return Ok(false);
        }
        records.insert(key, record);
        Ok(true)
    }

    async fn get(
        &self,
        event_id: EventId,
        service_name: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        Ok(self
            .records
            .read()
            .await
            .get(&(event_id, service_name.to_string()))
            .cloned())
    }
}
