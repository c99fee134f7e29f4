use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CorrelationId, OrderId, ReservationId};
use tokio::sync::RwLock;

use crate::{
    CompensationEntry, CompensationStatus, CreateOutcome, MirrorStatus, Order, OrderReservation,
    OrderStatus, RecordedReservation, Result, SagaError, SagaState, SagaStatus, SagaStore,
};

#[derive(Debug, Default)]
struct OrderDomainState {
    sagas: HashMap<CorrelationId, SagaState>,
    orders: HashMap<OrderId, Order>,
    mirrors: HashMap<ReservationId, OrderReservation>,
    compensations: Vec<CompensationEntry>,
    next_compensation_id: i64,
}

impl OrderDomainState {
    fn has_pending_compensation(&self, order_id: OrderId) -> bool {
        self.compensations
            .iter()
            .any(|e| e.order_id == order_id && e.is_pending())
    }
}

/// In-memory order domain store, for tests and single-process runs.
#[derive(Debug, Clone, Default)]
pub struct InMemorySagaStore {
    state: Arc<RwLock<OrderDomainState>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn saga_count(&self) -> usize {
        self.state.read().await.sagas.len()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn create(&self, saga: &SagaState, order: &Order) -> Result<CreateOutcome> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.sagas.get(&saga.correlation_id) {
            return Ok(CreateOutcome::Existing(existing.clone()));
        }

        let mut stored = saga.clone();
        stored.version = 1;
        state.orders.insert(order.order_id, order.clone());
        state.sagas.insert(stored.correlation_id, stored.clone());
        Ok(CreateOutcome::Created(stored))
    }

    async fn get(&self, correlation_id: CorrelationId) -> Result<Option<SagaState>> {
        Ok(self.state.read().await.sagas.get(&correlation_id).cloned())
    }

    async fn find_by_order(&self, order_id: OrderId) -> Result<Option<SagaState>> {
        let state = self.state.read().await;
        Ok(state
            .sagas
            .values()
            .find(|s| s.order_id == Some(order_id))
            .cloned())
    }

    async fn update(&self, saga: &SagaState, now: DateTime<Utc>) -> Result<SagaState> {
        let mut state = self.state.write().await;
        let stored = state
            .sagas
            .get_mut(&saga.correlation_id)
            .ok_or(SagaError::SagaNotFound(saga.correlation_id))?;

        if stored.version != saga.version {
            return Err(SagaError::ConcurrencyConflict {
                correlation_id: saga.correlation_id,
                expected: saga.version,
            });
        }

        let mut updated = saga.clone();
        updated.version += 1;
        updated.updated_at = now;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn expired(
        &self,
        statuses: &[SagaStatus],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaState>> {
        let state = self.state.read().await;
        let mut sagas: Vec<SagaState> = state
            .sagas
            .values()
            .filter(|s| statuses.contains(&s.status) && s.is_expired(now))
            .cloned()
            .collect();
        sagas.sort_by_key(|s| s.expires_at);
        sagas.truncate(limit);
        Ok(sagas)
    }

    async fn overdue_compensations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaState>> {
        let state = self.state.read().await;
        let mut sagas: Vec<SagaState> = state
            .sagas
            .values()
            .filter(|s| matches!(s.status, SagaStatus::Failed | SagaStatus::Cancelled))
            .filter(|s| s.is_expired(now))
            .filter(|s| s.order_id.is_some_and(|id| state.has_pending_compensation(id)))
            .cloned()
            .collect();
        sagas.sort_by_key(|s| s.expires_at);
        sagas.truncate(limit);
        Ok(sagas)
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        Ok(self.state.read().await.orders.get(&order_id).cloned())
    }

    async fn set_order_status(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or(SagaError::OrderNotFound(order_id))?;
        order.status = status;
        order.updated_at = now;
        Ok(())
    }

    async fn record_reservation(
        &self,
        mirror: OrderReservation,
        entry: CompensationEntry,
    ) -> Result<RecordedReservation> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.mirrors.get(&mirror.reservation_id) {
            return Ok(RecordedReservation {
                mirror: existing.clone(),
                inserted: false,
            });
        }

        state.next_compensation_id += 1;
        let mut entry = entry;
        entry.id = state.next_compensation_id;
        state.compensations.push(entry);
        state.mirrors.insert(mirror.reservation_id, mirror.clone());
        Ok(RecordedReservation {
            mirror,
            inserted: true,
        })
    }

    async fn reservations(&self, order_id: OrderId) -> Result<Vec<OrderReservation>> {
        let state = self.state.read().await;
        let mut mirrors: Vec<OrderReservation> = state
            .mirrors
            .values()
            .filter(|m| m.order_id == order_id)
            .cloned()
            .collect();
        mirrors.sort_by_key(|m| (m.created_at, m.reservation_id));
        Ok(mirrors)
    }

    async fn release_reservation(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<Option<OrderReservation>> {
        let mut state = self.state.write().await;
        Ok(match state.mirrors.get_mut(&reservation_id) {
            Some(mirror) if mirror.is_reserved() => {
                mirror.status = MirrorStatus::Released;
                mirror.released_at = Some(now);
                Some(mirror.clone())
            }
            _ => None,
        })
    }

    async fn compensations(&self, order_id: OrderId) -> Result<Vec<CompensationEntry>> {
        let state = self.state.read().await;
        Ok(state
            .compensations
            .iter()
            .filter(|e| e.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn complete_compensation(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let entry = state
            .compensations
            .iter_mut()
            .find(|e| e.is_pending() && e.reservation_id() == Some(reservation_id));
        Ok(match entry {
            Some(entry) => {
                entry.status = CompensationStatus::Completed;
                entry.completed_at = Some(now);
                true
            }
            None => false,
        })
    }

    async fn fail_pending_compensations(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<Vec<CompensationEntry>> {
        let mut state = self.state.write().await;
        let mut failed = Vec::new();
        for entry in state
            .compensations
            .iter_mut()
            .filter(|e| e.order_id == order_id && e.is_pending())
        {
            entry.status = CompensationStatus::Failed;
            entry.completed_at = Some(now);
            failed.push(entry.clone());
        }
        Ok(failed)
    }
}
