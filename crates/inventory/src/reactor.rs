//! The inventory domain's side of the checkout saga.
//!
//! Reacts to order events; never decides saga direction.

use std::sync::Arc;

use async_trait::async_trait;
use idempotency::{EventHandler, IdempotencyGuard, IdempotentDispatcher};
use messaging::{
    EventEnvelope, HandlerError, OrderCancelled, OrderConfirmed, OrderCreated, OrderFailed,
    RetryPolicy,
};

use crate::{InventoryError, InventoryLedger, ReservationRequest};

pub struct InventoryReactor {
    ledger: InventoryLedger,
}

impl InventoryReactor {
    pub fn new(ledger: InventoryLedger) -> Arc<Self> {
        Arc::new(Self { ledger })
    }

    /// Builds the dispatcher to subscribe on the products queue.
    pub fn dispatcher(
        self: &Arc<Self>,
        guard: IdempotencyGuard,
        retry: RetryPolicy,
    ) -> IdempotentDispatcher {
        IdempotentDispatcher::new(guard)
            .with_retry(retry)
            .on::<OrderCreated>("reserve_stock", self.clone())
            .on::<OrderConfirmed>("fulfill_reservations", self.clone())
            .on::<OrderFailed>("release_reservations", self.clone())
            .on::<OrderCancelled>("release_reservations", self.clone())
    }
}

#[async_trait]
impl EventHandler<OrderCreated> for InventoryReactor {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        event: OrderCreated,
    ) -> Result<String, HandlerError> {
        for line in &event.items {
            let request = ReservationRequest {
                reservation_id: line.reservation_id,
                product_id: line.product_id,
                quantity: line.quantity,
                order_id: event.order_id,
                correlation_id: envelope.correlation_id,
            };
            match self.ledger.reserve(request).await {
                Ok(_) => {}
                // Refusal is silent; the saga times out.
                Err(InventoryError::InsufficientStock { product_id, .. }) => {
                    return Ok(format!("refused:{product_id}"));
                }
                Err(InventoryError::UnknownProduct(product_id)) => {
                    tracing::warn!(%product_id, "order line for unknown product");
                    return Ok(format!("refused:{product_id}"));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok("reserved".into())
    }
}

#[async_trait]
impl EventHandler<OrderConfirmed> for InventoryReactor {
    async fn handle(
        &self,
        _envelope: &EventEnvelope,
        event: OrderConfirmed,
    ) -> Result<String, HandlerError> {
        let fulfilled = self.ledger.fulfill(event.order_id).await?;
        if fulfilled.is_empty() {
            return Ok("not_fulfilled".into());
        }
        Ok(format!("fulfilled:{}", fulfilled.len()))
    }
}

#[async_trait]
impl EventHandler<OrderFailed> for InventoryReactor {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        event: OrderFailed,
    ) -> Result<String, HandlerError> {
        let released = self
            .ledger
            .release_order(event.order_id, envelope.correlation_id, &[], "order_failed")
            .await?;
        Ok(format!("released:{released}"))
    }
}

#[async_trait]
impl EventHandler<OrderCancelled> for InventoryReactor {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        event: OrderCancelled,
    ) -> Result<String, HandlerError> {
        let released = self
            .ledger
            .release_order(event.order_id, envelope.correlation_id, &[], "order_cancelled")
            .await?;
        Ok(format!("released:{released}"))
    }
}
