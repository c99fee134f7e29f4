use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{CartId, CorrelationId, Money, OrderId, ProductId, ReservationId, UserId};
use messaging::OrderLine;
use serde::{Deserialize, Serialize};

use crate::SagaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Placed,
    Confirmed,
    Failed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Placed => "placed",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Failed => "failed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Confirmed | OrderStatus::Failed | OrderStatus::Cancelled
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "placed" => Ok(OrderStatus::Placed),
            "confirmed" => Ok(OrderStatus::Confirmed),
            "failed" => Ok(OrderStatus::Failed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(SagaError::InvalidStatus(other.to_string())),
        }
    }
}

/// The order row owned by the order domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub correlation_id: CorrelationId,
    pub user_id: UserId,
    pub cart_id: CartId,
    pub items: Vec<OrderLine>,
    pub total: Money,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// A freshly created order, still waiting for its reservations.
    pub fn pending(
        order_id: OrderId,
        correlation_id: CorrelationId,
        user_id: UserId,
        cart_id: CartId,
        items: Vec<OrderLine>,
        total: Money,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id,
            correlation_id,
            user_id,
            cart_id,
            items,
            total,
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorStatus {
    Reserved,
    Released,
}

impl MirrorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorStatus::Reserved => "reserved",
            MirrorStatus::Released => "released",
        }
    }
}

impl FromStr for MirrorStatus {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(MirrorStatus::Reserved),
            "released" => Ok(MirrorStatus::Released),
            other => Err(SagaError::InvalidStatus(other.to_string())),
        }
    }
}

/// The order domain's copy of a reservation inventory confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReservation {
    pub reservation_id: ReservationId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub status: MirrorStatus,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl OrderReservation {
    pub fn reserved(
        reservation_id: ReservationId,
        order_id: OrderId,
        product_id: ProductId,
        quantity: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            reservation_id,
            order_id,
            product_id,
            quantity,
            status: MirrorStatus::Reserved,
            created_at: now,
            released_at: None,
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.status == MirrorStatus::Reserved
    }
}
