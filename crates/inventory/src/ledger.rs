//! Reservation bookkeeping plus the events that announce it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{CorrelationId, OrderId, ReservationId};
use messaging::{EventPublisher, StockReleased, StockReserved};

use crate::{
    InventoryError, InventoryStore, ReleaseOutcome, ReserveOutcome, Reservation,
    ReservationRequest, ReservationStatus, Result,
};

/// Release reason used by the expiry sweep.
pub const EXPIRED_REASON: &str = "expired";

/// Release reason when a release names a reservation inventory never held.
pub const UNKNOWN_RESERVATION_REASON: &str = "unknown_reservation";

/// Default lifetime of an unconfirmed reservation.
pub const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(30 * 60);

/// The inventory domain's service: owns every reservation state change and
/// publishes `StockReserved`/`StockReleased` for them.
#[derive(Clone)]
pub struct InventoryLedger {
    store: Arc<dyn InventoryStore>,
    publisher: EventPublisher,
    reservation_ttl: Duration,
}

impl InventoryLedger {
    pub fn new(store: Arc<dyn InventoryStore>, publisher: EventPublisher) -> Self {
        Self {
            store,
            publisher,
            reservation_ttl: DEFAULT_RESERVATION_TTL,
        }
    }

    pub fn with_reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<dyn InventoryStore> {
        &self.store
    }

    /// Places a hold and announces it.
    ///
    /// A repeated `reservation_id` returns the existing row; if that row is
    /// still reserved `StockReserved` is published again so a saga that
    /// missed the first one can progress.
    #[tracing::instrument(skip(self, request), fields(
        reservation_id = %request.reservation_id,
        product_id = %request.product_id,
        quantity = request.quantity,
        order_id = %request.order_id,
    ))]
    pub async fn reserve(&self, request: ReservationRequest) -> Result<Reservation> {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(self.reservation_ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(30));

        let outcome = match self.store.reserve(request, now, expires_at).await {
            Ok(outcome) => outcome,
            Err(err @ InventoryError::InsufficientStock { .. }) => {
                metrics::counter!("reservations_refused_total").increment(1);
                tracing::warn!(error = %err, "reservation refused");
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let (reservation, announce) = match outcome {
            ReserveOutcome::Created(r) => {
                tracing::info!("stock reserved");
                (r, true)
            }
            ReserveOutcome::Existing(r) => {
                tracing::debug!(status = %r.status, "reservation already exists");
                let still_held = r.is_reserved();
                (r, still_held)
            }
        };

        if announce {
            self.publisher
                .publish(
                    reservation.correlation_id,
                    &StockReserved {
                        product_id: reservation.product_id,
                        quantity: reservation.quantity,
                        order_id: reservation.order_id,
                        reservation_id: reservation.reservation_id,
                    },
                )
                .await?;
        }
        Ok(reservation)
    }

    /// Releases one reservation. Always publishes `StockReleased`, even when
    /// the reservation was already final or never existed.
    #[tracing::instrument(skip(self), fields(%reservation_id, %correlation_id))]
    pub async fn release(
        &self,
        reservation_id: ReservationId,
        correlation_id: CorrelationId,
        reason: &str,
    ) -> Result<ReleaseOutcome> {
        let outcome = self
            .store
            .release(reservation_id, ReservationStatus::Released, Utc::now())
            .await?;

        let event = match &outcome {
            ReleaseOutcome::Released(r) => {
                tracing::info!(product_id = %r.product_id, quantity = r.quantity, "reservation released");
                released_event(r, reason)
            }
            ReleaseOutcome::Unchanged(r) => {
                tracing::debug!(status = %r.status, "reservation already final");
                released_event(r, reason)
            }
            ReleaseOutcome::NotFound => {
                tracing::debug!("release for unknown reservation");
                StockReleased {
                    product_id: None,
                    quantity: 0,
                    reservation_id,
                    order_id: None,
                    reason: UNKNOWN_RESERVATION_REASON.to_string(),
                }
            }
        };

        self.publisher.publish(correlation_id, &event).await?;
        Ok(outcome)
    }

    /// Releases every non-fulfilled reservation of the order, plus any
    /// reservation ids the caller expected but inventory never held.
    #[tracing::instrument(skip(self, expected), fields(%order_id, %correlation_id))]
    pub async fn release_order(
        &self,
        order_id: OrderId,
        correlation_id: CorrelationId,
        expected: &[ReservationId],
        reason: &str,
    ) -> Result<usize> {
        let held = self.store.for_order(order_id).await?;

        let mut ids: Vec<ReservationId> = held
            .iter()
            .filter(|r| r.status != ReservationStatus::Fulfilled)
            .map(|r| r.reservation_id)
            .collect();
        for id in expected {
            if !held.iter().any(|r| r.reservation_id == *id) {
                ids.push(*id);
            }
        }

        for id in &ids {
            self.release(*id, correlation_id, reason).await?;
        }
        Ok(ids.len())
    }

    /// Commits the order's holds: stock leaves the warehouse.
    ///
    /// Nothing is committed once any line of the order lapsed; the saga
    /// fails that order on the line's `StockReleased{reason:"expired"}`.
    #[tracing::instrument(skip(self), fields(%order_id))]
    pub async fn fulfill(&self, order_id: OrderId) -> Result<Vec<Reservation>> {
        let fulfilled = self.store.fulfill_order(order_id, Utc::now()).await?;
        if fulfilled.is_empty() {
            tracing::warn!("order has no intact holds, nothing fulfilled");
        } else {
            tracing::info!(count = fulfilled.len(), "reservations fulfilled");
        }
        Ok(fulfilled)
    }

    /// Expires reservations past their `expires_at` and announces them.
    /// Returns how many expiries were announced by this call.
    ///
    /// A row is marked expired before its event is published, so a
    /// confirmation can never commit a hold that was announced as gone. If
    /// the publish fails the row stays unannounced and the next sweep
    /// publishes it again.
    pub async fn expire_due(&self, limit: usize) -> Result<usize> {
        let now = Utc::now();
        let mut announced = 0;
        for due in self.store.due_for_expiry(now, limit).await? {
            let expired = if due.is_reserved() {
                match self
                    .store
                    .release(due.reservation_id, ReservationStatus::Expired, now)
                    .await?
                {
                    ReleaseOutcome::Released(r) => {
                        tracing::info!(reservation_id = %r.reservation_id, order_id = %r.order_id, "reservation expired");
                        r
                    }
                    ReleaseOutcome::Unchanged(r) if r.is_unannounced_expiry() => r,
                    // Released or fulfilled in the meantime.
                    ReleaseOutcome::Unchanged(_) | ReleaseOutcome::NotFound => continue,
                }
            } else {
                tracing::info!(reservation_id = %due.reservation_id, "announcing earlier expiry");
                due
            };

            self.publisher
                .publish(
                    expired.correlation_id,
                    &released_event(&expired, EXPIRED_REASON),
                )
                .await?;
            self.store
                .mark_expiry_announced(expired.reservation_id)
                .await?;
            announced += 1;
        }
        Ok(announced)
    }
}

fn released_event(reservation: &Reservation, reason: &str) -> StockReleased {
    StockReleased {
        product_id: Some(reservation.product_id),
        quantity: reservation.quantity,
        reservation_id: reservation.reservation_id,
        order_id: Some(reservation.order_id),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryInventoryStore;
    use common::ProductId;
    use messaging::{InMemoryBroker, Topology};

    async fn ledger(stock: i64) -> (InventoryLedger, InMemoryBroker) {
        let broker = InMemoryBroker::new(Topology::checkout());
        let store = InMemoryInventoryStore::new();
        store.set_stock(ProductId::new(1), stock).await.unwrap();
        let ledger = InventoryLedger::new(
            Arc::new(store),
            EventPublisher::new(Arc::new(broker.clone())),
        );
        (ledger, broker)
    }

    fn request(quantity: u32) -> ReservationRequest {
        ReservationRequest {
            reservation_id: ReservationId::new(),
            product_id: ProductId::new(1),
            quantity,
            order_id: OrderId::new(),
            correlation_id: CorrelationId::new(),
        }
    }

    #[tokio::test]
    async fn refused_reservation_publishes_nothing() {
        let (ledger, broker) = ledger(3).await;

        let err = ledger.reserve(request(10)).await.unwrap_err();

        assert!(matches!(err, InventoryError::InsufficientStock { .. }));
        assert!(broker.published().await.is_empty());
    }

    #[tokio::test]
    async fn reserve_publishes_with_saga_correlation() {
        let (ledger, broker) = ledger(3).await;
        let req = request(2);
        let correlation_id = req.correlation_id;

        ledger.reserve(req).await.unwrap();

        let published = broker.published_of("StockReserved").await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].correlation_id, correlation_id);
    }

    #[tokio::test]
    async fn repeated_reserve_republishes_while_held() {
        let (ledger, broker) = ledger(3).await;
        let req = request(2);

        ledger.reserve(req.clone()).await.unwrap();
        ledger.reserve(req).await.unwrap();

        assert_eq!(broker.published_of("StockReserved").await.len(), 2);
        let level = ledger
            .store()
            .stock_level(ProductId::new(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(level.reserved, 2);
    }

    #[tokio::test]
    async fn release_of_missing_reservation_still_publishes() {
        let (ledger, broker) = ledger(3).await;

        let outcome = ledger
            .release(ReservationId::new(), CorrelationId::new(), "order_failed")
            .await
            .unwrap();

        assert_eq!(outcome, ReleaseOutcome::NotFound);
        let released = broker.published_of("StockReleased").await;
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].decode::<StockReleased>().unwrap().quantity, 0);
    }

    #[tokio::test]
    async fn release_order_skips_fulfilled_and_covers_expected() {
        let (ledger, broker) = ledger(10).await;
        let req = request(2);
        let order_id = req.order_id;
        let correlation_id = req.correlation_id;
        ledger.reserve(req).await.unwrap();
        let never_held = ReservationId::new();

        let count = ledger
            .release_order(order_id, correlation_id, &[never_held], "order_cancelled")
            .await
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(broker.published_of("StockReleased").await.len(), 2);
        let level = ledger
            .store()
            .stock_level(ProductId::new(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(level.available(), 10);
    }

    #[tokio::test]
    async fn expire_due_publishes_expired_reason() {
        let (ledger, broker) = ledger(5).await;
        let ledger = ledger.with_reservation_ttl(Duration::ZERO);
        ledger.reserve(request(1)).await.unwrap();

        let expired = ledger.expire_due(100).await.unwrap();

        assert_eq!(expired, 1);
        let released = broker.published_of("StockReleased").await;
        assert_eq!(released.len(), 1);
        assert_eq!(
            released[0].decode::<StockReleased>().unwrap().reason,
            EXPIRED_REASON
        );
    }

    #[tokio::test]
    async fn expiry_is_announced_again_after_failed_publish() {
        let (ledger, broker) = ledger(5).await;
        let ledger = ledger.with_reservation_ttl(Duration::ZERO);
        let reservation = ledger.reserve(request(1)).await.unwrap();

        broker.fail_publishes(1).await;
        assert!(ledger.expire_due(100).await.is_err());
        let row = ledger
            .store()
            .get(reservation.reservation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ReservationStatus::Expired);
        assert!(broker.published_of("StockReleased").await.is_empty());

        assert_eq!(ledger.expire_due(100).await.unwrap(), 1);
        let released = broker.published_of("StockReleased").await;
        assert_eq!(released.len(), 1);
        let event: StockReleased = released[0].decode().unwrap();
        assert_eq!(event.reservation_id, reservation.reservation_id);
        assert_eq!(event.reason, EXPIRED_REASON);

        assert_eq!(ledger.expire_due(100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fulfill_commits_nothing_once_a_line_expired() {
        let (ledger, _broker) = ledger(10).await;
        let first = request(2);
        let order_id = first.order_id;
        let second = ReservationRequest {
            reservation_id: ReservationId::new(),
            ..first.clone()
        };
        ledger.reserve(first.clone()).await.unwrap();
        ledger.reserve(second).await.unwrap();
        ledger
            .store()
            .release(first.reservation_id, ReservationStatus::Expired, Utc::now())
            .await
            .unwrap();

        assert!(ledger.fulfill(order_id).await.unwrap().is_empty());

        let level = ledger
            .store()
            .stock_level(ProductId::new(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!((level.total_stock, level.reserved), (10, 2));
    }
}
