use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CorrelationId, OrderId, ReservationId};

use crate::{
    CompensationEntry, Order, OrderReservation, OrderStatus, Result, SagaState, SagaStatus,
};

/// Result of [`SagaStore::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(SagaState),
    /// A saga with the same correlation id was already stored.
    Existing(SagaState),
}

impl CreateOutcome {
    pub fn into_saga(self) -> SagaState {
        match self {
            CreateOutcome::Created(s) | CreateOutcome::Existing(s) => s,
        }
    }
}

/// Result of [`SagaStore::record_reservation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedReservation {
    /// The stored mirror row, which may predate this call.
    pub mirror: OrderReservation,
    pub inserted: bool,
}

/// Persistence for the order domain: sagas, orders, reservation mirrors and
/// the compensation log.
///
/// Saga rows use optimistic concurrency: [`SagaStore::update`] only writes
/// if the stored version still equals the version the caller read.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Stores a new saga and its order row in one write, unless a saga with
    /// the same correlation id exists.
    async fn create(&self, saga: &SagaState, order: &Order) -> Result<CreateOutcome>;

    async fn get(&self, correlation_id: CorrelationId) -> Result<Option<SagaState>>;

    async fn find_by_order(&self, order_id: OrderId) -> Result<Option<SagaState>>;

    /// Writes `saga` if the stored version is `saga.version`, returning the
    /// stored state with the bumped version. Fails with
    /// `ConcurrencyConflict` otherwise.
    async fn update(&self, saga: &SagaState, now: DateTime<Utc>) -> Result<SagaState>;

    /// Sagas in one of `statuses` whose deadline is at or before `now`.
    async fn expired(
        &self,
        statuses: &[SagaStatus],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaState>>;

    /// Failed or cancelled sagas past their deadline that still have
    /// pending compensation entries.
    async fn overdue_compensations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaState>>;

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>>;

    async fn set_order_status(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Inserts the mirror row and its compensation entry together. A
    /// repeated reservation id leaves both untouched.
    async fn record_reservation(
        &self,
        mirror: OrderReservation,
        entry: CompensationEntry,
    ) -> Result<RecordedReservation>;

    async fn reservations(&self, order_id: OrderId) -> Result<Vec<OrderReservation>>;

    /// True while the saga has no recorded failure and every order line
    /// still has a reserved mirror.
    async fn holds_intact(&self, saga: &SagaState) -> Result<bool> {
        let Some(order_id) = saga.order_id else {
            return Ok(false);
        };
        if saga.payload.failure.is_some() || !saga.payload.all_reserved() {
            return Ok(false);
        }
        let mirrors = self.reservations(order_id).await?;
        Ok(saga.payload.items.iter().all(|line| {
            mirrors
                .iter()
                .any(|m| m.reservation_id == line.reservation_id && m.is_reserved())
        }))
    }

    /// Marks a reserved mirror released. Returns the row if it changed.
    async fn release_reservation(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<Option<OrderReservation>>;

    /// The order's compensation entries, oldest first.
    async fn compensations(&self, order_id: OrderId) -> Result<Vec<CompensationEntry>>;

    /// Completes the pending release entry for `reservation_id`. Returns
    /// false if there was none.
    async fn complete_compensation(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Marks every pending entry of the order failed and returns them.
    async fn fail_pending_compensations(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<Vec<CompensationEntry>>;
}
