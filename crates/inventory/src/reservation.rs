use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{CorrelationId, OrderId, ProductId, ReservationId};
use serde::{Deserialize, Serialize};

use crate::InventoryError;

/// Lifecycle of a reservation. `Reserved` moves to exactly one of the
/// other three and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Reserved,
    Released,
    Expired,
    Fulfilled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
            ReservationStatus::Fulfilled => "fulfilled",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, ReservationStatus::Reserved)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = InventoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(ReservationStatus::Reserved),
            "released" => Ok(ReservationStatus::Released),
            "expired" => Ok(ReservationStatus::Expired),
            "fulfilled" => Ok(ReservationStatus::Fulfilled),
            other => Err(InventoryError::InvalidStatus(other.to_string())),
        }
    }
}

/// A hold on `quantity` units of a product for one order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: ReservationId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub order_id: OrderId,
    /// The saga the reservation was made for; stamped on every event
    /// published about it.
    pub correlation_id: CorrelationId,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    /// Set once `StockReleased{reason:"expired"}` went out for an expired
    /// row. An expired row without it is announced again by the next sweep.
    #[serde(default)]
    pub expiry_announced: bool,
}

impl Reservation {
    pub fn is_reserved(&self) -> bool {
        self.status == ReservationStatus::Reserved
    }

    /// True once the hold has outlived its expiry while still reserved.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_reserved() && self.expires_at <= now
    }

    /// Expired, but the release event was never published.
    pub fn is_unannounced_expiry(&self) -> bool {
        self.status == ReservationStatus::Expired && !self.expiry_announced
    }
}

/// Everything needed to place a hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub reservation_id: ReservationId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub order_id: OrderId,
    pub correlation_id: CorrelationId,
}

impl ReservationRequest {
    /// Builds the reserved row this request would insert.
    pub fn into_reservation(self, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Reservation {
        Reservation {
            reservation_id: self.reservation_id,
            product_id: self.product_id,
            quantity: self.quantity,
            order_id: self.order_id,
            correlation_id: self.correlation_id,
            status: ReservationStatus::Reserved,
            created_at: now,
            expires_at,
            released_at: None,
            expiry_announced: false,
        }
    }
}

/// Stock figures for one product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub product_id: ProductId,
    pub total_stock: i64,
    /// Sum of quantities of `Reserved` rows.
    pub reserved: i64,
}

impl StockLevel {
    pub fn available(&self) -> i64 {
        self.total_stock - self.reserved
    }
}
