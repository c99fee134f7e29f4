use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, ReservationId};

use crate::{Reservation, ReservationRequest, ReservationStatus, Result, StockLevel};

/// Result of [`InventoryStore::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// A new hold was placed.
    Created(Reservation),
    /// The reservation id was already known; nothing changed.
    Existing(Reservation),
}

impl ReserveOutcome {
    pub fn reservation(&self) -> &Reservation {
        match self {
            ReserveOutcome::Created(r) | ReserveOutcome::Existing(r) => r,
        }
    }

    pub fn into_reservation(self) -> Reservation {
        match self {
            ReserveOutcome::Created(r) | ReserveOutcome::Existing(r) => r,
        }
    }
}

/// Result of [`InventoryStore::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The hold moved out of `reserved` in this call.
    Released(Reservation),
    /// The reservation had already left `reserved`.
    Unchanged(Reservation),
    NotFound,
}

/// Persistence for stock levels and reservations.
///
/// `reserve` must check availability and insert atomically per product.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn set_stock(&self, product_id: ProductId, total_stock: i64) -> Result<()>;

    async fn stock_level(&self, product_id: ProductId) -> Result<Option<StockLevel>>;

    async fn reserve(
        &self,
        request: ReservationRequest,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<ReserveOutcome>;

    async fn get(&self, reservation_id: ReservationId) -> Result<Option<Reservation>>;

    async fn for_order(&self, order_id: OrderId) -> Result<Vec<Reservation>>;

    /// Moves a `reserved` row to `to` (`Released` or `Expired`).
    async fn release(
        &self,
        reservation_id: ReservationId,
        to: ReservationStatus,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome>;

    /// Commits the order's holds: all of its rows move to `fulfilled` and
    /// total stock drops by their quantities in the same write.
    ///
    /// All or nothing. If any row of the order already left `reserved`,
    /// nothing changes and the result is empty.
    async fn fulfill_order(&self, order_id: OrderId, now: DateTime<Utc>)
    -> Result<Vec<Reservation>>;

    /// Rows the expiry sweep still has to announce: reserved rows whose
    /// `expires_at` is at or before `now`, plus expired rows whose release
    /// event never went out.
    async fn due_for_expiry(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Reservation>>;

    /// Records that the expiry of `reservation_id` was published.
    async fn mark_expiry_announced(&self, reservation_id: ReservationId) -> Result<()>;
}
