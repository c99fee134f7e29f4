//! Event payloads exchanged between the cart, order and inventory domains.
//!
//! Each payload knows the topic it is published on and the routing key it is
//! published with, so publishers never spell those out by hand.

use common::{CartId, LineItem, Money, OrderId, ProductId, ReservationId, UserId};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::topology::{CART_TOPIC, ORDERS_TOPIC, PRODUCTS_TOPIC};

/// A typed event payload.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync {
    /// The `event_type` written into the envelope.
    const EVENT_TYPE: &'static str;

    /// The `aggregate_type` written into the envelope.
    const AGGREGATE_TYPE: &'static str;

    /// The topic this event is published to.
    const TOPIC: &'static str;

    /// The hierarchical routing key (`domain.entity.action`).
    const ROUTING_KEY: &'static str;

    /// The aggregate this event belongs to.
    fn aggregate_id(&self) -> String;
}

macro_rules! domain_event {
    ($ty:ty, $event_type:literal, $aggregate:literal, $topic:expr, $key:literal, |$e:ident| $id:expr) => {
        impl DomainEvent for $ty {
            const EVENT_TYPE: &'static str = $event_type;
            const AGGREGATE_TYPE: &'static str = $aggregate;
            const TOPIC: &'static str = $topic;
            const ROUTING_KEY: &'static str = $key;

            fn aggregate_id(&self) -> String {
                let $e = self;
                $id.to_string()
            }
        }
    };
}

/// A line of an order, carrying the reservation minted for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price: Money,
    pub reservation_id: ReservationId,
}

impl OrderLine {
    pub fn line_total(&self) -> Money {
        self.unit_price.multiply(self.quantity)
    }
}

/// Published by the cart domain when a checkout starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartCheckoutInitiated {
    pub cart_id: CartId,
    pub user_id: UserId,
    pub total: Money,
    pub items: Vec<LineItem>,
}

/// Published by the orchestrator once the pending order row exists; asks
/// inventory to reserve every line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub total: Money,
    pub items: Vec<OrderLine>,
}

/// Published by the orchestrator once every line is reserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub total: Money,
    pub items: Vec<OrderLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    pub order_id: OrderId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFailed {
    pub order_id: OrderId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: OrderId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReserved {
    pub product_id: ProductId,
    pub quantity: u32,
    pub order_id: OrderId,
    pub reservation_id: ReservationId,
}

/// Published whenever a reservation is released, expired, or a release was
/// requested for a reservation inventory never held. In the last case
/// `product_id` and `order_id` are absent and `quantity` is zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReleased {
    pub product_id: Option<ProductId>,
    pub quantity: u32,
    pub reservation_id: ReservationId,
    pub order_id: Option<OrderId>,
    pub reason: String,
}

domain_event!(CartCheckoutInitiated, "CartCheckoutInitiated", "Cart", CART_TOPIC, "cart.checkout.initiated", |e| e.cart_id);
domain_event!(OrderCreated, "OrderCreated", "Order", ORDERS_TOPIC, "order.created", |e| e.order_id);
domain_event!(OrderPlaced, "OrderPlaced", "Order", ORDERS_TOPIC, "order.placed", |e| e.order_id);
domain_event!(OrderConfirmed, "OrderConfirmed", "Order", ORDERS_TOPIC, "order.confirmed", |e| e.order_id);
domain_event!(OrderFailed, "OrderFailed", "Order", ORDERS_TOPIC, "order.failed", |e| e.order_id);
domain_event!(OrderCancelled, "OrderCancelled", "Order", ORDERS_TOPIC, "order.cancelled", |e| e.order_id);
domain_event!(StockReserved, "StockReserved", "Product", PRODUCTS_TOPIC, "product.stock.reserved", |e| e.product_id);
domain_event!(StockReleased, "StockReleased", "Product", PRODUCTS_TOPIC, "product.stock.released", |e| e.reservation_id);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_placed_carries_items_and_total() {
        let line = OrderLine {
            product_id: ProductId::new(1),
            quantity: 2,
            unit_price: Money::from_cents(1000),
            reservation_id: ReservationId::new(),
        };
        let event = OrderPlaced {
            order_id: OrderId::new(),
            user_id: UserId::new(9),
            total: Money::from_cents(2000),
            items: vec![line.clone()],
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["total"], 2000);
        assert_eq!(json["items"][0]["quantity"], 2);
        assert_eq!(json["items"][0]["reservation_id"], line.reservation_id.to_string());
    }

    #[test]
    fn routing_keys_are_hierarchical() {
        for key in [
            CartCheckoutInitiated::ROUTING_KEY,
            OrderCreated::ROUTING_KEY,
            OrderPlaced::ROUTING_KEY,
            OrderConfirmed::ROUTING_KEY,
            OrderFailed::ROUTING_KEY,
            OrderCancelled::ROUTING_KEY,
            StockReserved::ROUTING_KEY,
            StockReleased::ROUTING_KEY,
        ] {
            assert!(key.split('.').count() >= 2, "{key}");
        }
    }

    #[test]
    fn stock_released_aggregate_is_the_reservation() {
        let event = StockReleased {
            product_id: None,
            quantity: 0,
            reservation_id: ReservationId::new(),
            order_id: None,
            reason: "unknown_reservation".into(),
        };
        assert_eq!(event.aggregate_id(), event.reservation_id.to_string());
    }
}
