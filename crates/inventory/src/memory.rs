use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, ReservationId};
use tokio::sync::RwLock;

use crate::{
    InventoryError, InventoryStore, ReleaseOutcome, ReserveOutcome, Reservation,
    ReservationRequest, ReservationStatus, Result, StockLevel,
};

#[derive(Debug, Default)]
struct InventoryState {
    stock: HashMap<ProductId, i64>,
    reservations: HashMap<ReservationId, Reservation>,
}

impl InventoryState {
    fn reserved_quantity(&self, product_id: ProductId) -> i64 {
        self.reservations
            .values()
            .filter(|r| r.product_id == product_id && r.is_reserved())
            .map(|r| i64::from(r.quantity))
            .sum()
    }
}

/// In-memory inventory store.
///
/// One lock guards stock and reservations together, which makes the
/// availability check and the insert atomic.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryStore {
    state: Arc<RwLock<InventoryState>>,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of reservations in any status.
    pub async fn reservation_count(&self) -> usize {
        self.state.read().await.reservations.len()
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn set_stock(&self, product_id: ProductId, total_stock: i64) -> Result<()> {
        self.state.write().await.stock.insert(product_id, total_stock);
        Ok(())
    }

    async fn stock_level(&self, product_id: ProductId) -> Result<Option<StockLevel>> {
        let state = self.state.read().await;
        Ok(state.stock.get(&product_id).map(|&total_stock| StockLevel {
            product_id,
            total_stock,
            reserved: state.reserved_quantity(product_id),
        }))
    }

    async fn reserve(
        &self,
        request: ReservationRequest,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<ReserveOutcome> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.reservations.get(&request.reservation_id) {
            return Ok(ReserveOutcome::Existing(existing.clone()));
        }
        if request.quantity == 0 {
            return Err(InventoryError::EmptyReservation(request.reservation_id));
        }

        let total = *state
            .stock
            .get(&request.product_id)
            .ok_or(InventoryError::UnknownProduct(request.product_id))?;
        let available = total - state.reserved_quantity(request.product_id);
        if available < i64::from(request.quantity) {
            return Err(InventoryError::InsufficientStock {
                product_id: request.product_id,
                requested: request.quantity,
                available,
            });
        }

        let reservation = request.into_reservation(now, expires_at);
        state
            .reservations
            .insert(reservation.reservation_id, reservation.clone());
        Ok(ReserveOutcome::Created(reservation))
    }

    async fn get(&self, reservation_id: ReservationId) -> Result<Option<Reservation>> {
        Ok(self.state.read().await.reservations.get(&reservation_id).cloned())
    }

    async fn for_order(&self, order_id: OrderId) -> Result<Vec<Reservation>> {
        let state = self.state.read().await;
        let mut reservations: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect();
        reservations.sort_by_key(|r| (r.created_at, r.reservation_id));
        Ok(reservations)
    }

    async fn release(
        &self,
        reservation_id: ReservationId,
        to: ReservationStatus,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome> {
        let mut state = self.state.write().await;
        let Some(reservation) = state.reservations.get_mut(&reservation_id) else {
            return Ok(ReleaseOutcome::NotFound);
        };
        if !reservation.is_reserved() {
            return Ok(ReleaseOutcome::Unchanged(reservation.clone()));
        }

        reservation.status = to;
        reservation.released_at = Some(now);
        Ok(ReleaseOutcome::Released(reservation.clone()))
    }

    async fn fulfill_order(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>> {
        let mut state = self.state.write().await;
        let InventoryState {
            stock,
            reservations,
        } = &mut *state;

        let held: Vec<&mut Reservation> = reservations
            .values_mut()
            .filter(|r| r.order_id == order_id)
            .collect();
        if held.iter().any(|r| !r.is_reserved()) {
            return Ok(Vec::new());
        }

        let mut fulfilled = Vec::new();
        for reservation in held {
            reservation.status = ReservationStatus::Fulfilled;
            reservation.released_at = Some(now);
            if let Some(total) = stock.get_mut(&reservation.product_id) {
                *total -= i64::from(reservation.quantity);
            }
            fulfilled.push(reservation.clone());
        }
        Ok(fulfilled)
    }

    async fn due_for_expiry(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Reservation>> {
        let state = self.state.read().await;
        let mut due: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|r| r.is_due(now) || r.is_unannounced_expiry())
            .cloned()
            .collect();
        due.sort_by_key(|r| r.expires_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_expiry_announced(&self, reservation_id: ReservationId) -> Result<()> {
        if let Some(reservation) = self.state.write().await.reservations.get_mut(&reservation_id) {
            reservation.expiry_announced = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use common::CorrelationId;

    fn request(product: i64, quantity: u32) -> ReservationRequest {
        ReservationRequest {
            reservation_id: ReservationId::new(),
            product_id: ProductId::new(product),
            quantity,
            order_id: OrderId::new(),
            correlation_id: CorrelationId::new(),
        }
    }

    async fn store_with_stock(total: i64) -> InMemoryInventoryStore {
        let store = InMemoryInventoryStore::new();
        store.set_stock(ProductId::new(1), total).await.unwrap();
        store
    }

    #[tokio::test]
    async fn refuses_when_available_is_short() {
        let store = store_with_stock(3).await;
        let now = Utc::now();

        let err = store
            .reserve(request(1, 10), now, now + Duration::minutes(30))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            InventoryError::InsufficientStock { requested: 10, available: 3, .. }
        ));
        assert_eq!(store.reservation_count().await, 0);
    }

    #[tokio::test]
    async fn reserving_the_same_id_twice_holds_once() {
        let store = store_with_stock(5).await;
        let now = Utc::now();
        let req = request(1, 2);

        let first = store
            .reserve(req.clone(), now, now + Duration::minutes(30))
            .await
            .unwrap();
        let second = store
            .reserve(req, now, now + Duration::minutes(30))
            .await
            .unwrap();

        assert!(matches!(first, ReserveOutcome::Created(_)));
        assert!(matches!(second, ReserveOutcome::Existing(_)));
        let level = store.stock_level(ProductId::new(1)).await.unwrap().unwrap();
        assert_eq!(level.reserved, 2);
        assert_eq!(level.available(), 3);
    }

    #[tokio::test]
    async fn release_frees_stock_once() {
        let store = store_with_stock(5).await;
        let now = Utc::now();
        let reservation = store
            .reserve(request(1, 5), now, now + Duration::minutes(30))
            .await
            .unwrap()
            .into_reservation();

        let first = store
            .release(reservation.reservation_id, ReservationStatus::Released, now)
            .await
            .unwrap();
        let second = store
            .release(reservation.reservation_id, ReservationStatus::Released, now)
            .await
            .unwrap();

        assert!(matches!(first, ReleaseOutcome::Released(_)));
        assert!(matches!(second, ReleaseOutcome::Unchanged(_)));
        let level = store.stock_level(ProductId::new(1)).await.unwrap().unwrap();
        assert_eq!(level.available(), 5);
    }

    #[tokio::test]
    async fn fulfill_decrements_total_stock() {
        let store = store_with_stock(5).await;
        let now = Utc::now();
        let req = request(1, 2);
        let order_id = req.order_id;
        store
            .reserve(req, now, now + Duration::minutes(30))
            .await
            .unwrap();

        let fulfilled = store.fulfill_order(order_id, now).await.unwrap();

        assert_eq!(fulfilled.len(), 1);
        let level = store.stock_level(ProductId::new(1)).await.unwrap().unwrap();
        assert_eq!(level.total_stock, 3);
        assert_eq!(level.reserved, 0);
        assert_eq!(level.available(), 3);
    }

    #[tokio::test]
    async fn due_for_expiry_skips_future_and_final_rows() {
        let store = store_with_stock(10).await;
        let now = Utc::now();
        let past = store
            .reserve(request(1, 1), now - Duration::hours(1), now - Duration::minutes(1))
            .await
            .unwrap()
            .into_reservation();
        store
            .reserve(request(1, 1), now, now + Duration::minutes(30))
            .await
            .unwrap();

        let due = store.due_for_expiry(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].reservation_id, past.reservation_id);

        store
            .release(past.reservation_id, ReservationStatus::Expired, now)
            .await
            .unwrap();
        let unannounced = store.due_for_expiry(now, 10).await.unwrap();
        assert_eq!(unannounced.len(), 1);
        assert_eq!(unannounced[0].status, ReservationStatus::Expired);

        store.mark_expiry_announced(past.reservation_id).await.unwrap();
        assert!(store.due_for_expiry(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fulfill_is_all_or_nothing() {
        let store = store_with_stock(10).await;
        let now = Utc::now();
        let first = request(1, 2);
        let order_id = first.order_id;
        let second = ReservationRequest {
            reservation_id: ReservationId::new(),
            ..first.clone()
        };
        let expires_at = now + Duration::minutes(30);
        store.reserve(first.clone(), now, expires_at).await.unwrap();
        store.reserve(second, now, expires_at).await.unwrap();
        store
            .release(first.reservation_id, ReservationStatus::Expired, now)
            .await
            .unwrap();

        assert!(store.fulfill_order(order_id, now).await.unwrap().is_empty());

        let rows = store.for_order(order_id).await.unwrap();
        assert!(rows.iter().all(|r| r.status != ReservationStatus::Fulfilled));
        let level = store.stock_level(ProductId::new(1)).await.unwrap().unwrap();
        assert_eq!((level.total_stock, level.reserved), (10, 2));
    }
}
