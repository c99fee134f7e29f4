use std::sync::Arc;

use async_trait::async_trait;
use idempotency::{EventHandler, IdempotencyGuard, IdempotentDispatcher};
use messaging::{
    EventEnvelope, HandlerError, OrderCancelled, OrderFailed, OrderPlaced, RetryPolicy,
};

use crate::{CartStatus, CartStore};

/// Updates the cart when its checkout saga places, fails or cancels the
/// order. Carts are located by the saga's correlation id.
pub struct CartReactor {
    store: Arc<dyn CartStore>,
}

impl CartReactor {
    pub fn new(store: Arc<dyn CartStore>) -> Arc<Self> {
        Arc::new(Self { store })
    }

    pub fn dispatcher(
        self: &Arc<Self>,
        guard: IdempotencyGuard,
        retry: RetryPolicy,
    ) -> IdempotentDispatcher {
        IdempotentDispatcher::new(guard)
            .with_retry(retry)
            .on::<OrderPlaced>("mark_checked_out", self.clone())
            .on::<OrderFailed>("reactivate_cart", self.clone())
            .on::<OrderCancelled>("reactivate_cart", self.clone())
    }

    async fn apply(
        &self,
        envelope: &EventEnvelope,
        target: CartStatus,
    ) -> Result<String, HandlerError> {
        match self.store.apply_outcome(envelope.correlation_id, target).await? {
            Some(cart) => {
                tracing::info!(cart_id = %cart.cart_id, status = %cart.status, "cart updated");
                Ok(target.as_str().to_string())
            }
            None => {
                tracing::debug!("no cart awaiting this outcome");
                Ok("ignored".to_string())
            }
        }
    }
}

#[async_trait]
impl EventHandler<OrderPlaced> for CartReactor {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        _event: OrderPlaced,
    ) -> Result<String, HandlerError> {
        self.apply(envelope, CartStatus::CheckedOut).await
    }
}

#[async_trait]
impl EventHandler<OrderFailed> for CartReactor {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        _event: OrderFailed,
    ) -> Result<String, HandlerError> {
        self.apply(envelope, CartStatus::Active).await
    }
}

#[async_trait]
impl EventHandler<OrderCancelled> for CartReactor {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        _event: OrderCancelled,
    ) -> Result<String, HandlerError> {
        self.apply(envelope, CartStatus::Active).await
    }
}
