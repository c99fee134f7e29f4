use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{CartId, CorrelationId};
use tokio::sync::RwLock;

use crate::{Cart, CartError, CartStatus, CartStore, Result};

#[derive(Debug, Clone, Default)]
pub struct InMemoryCartStore {
    carts: Arc<RwLock<HashMap<CartId, Cart>>>,
}

impl InMemoryCartStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CartStore for InMemoryCartStore {
    async fn get(&self, cart_id: CartId) -> Result<Option<Cart>> {
        Ok(self.carts.read().await.get(&cart_id).cloned())
    }

    async fn save(&self, cart: &Cart) -> Result<()> {
        self.carts.write().await.insert(cart.cart_id, cart.clone());
        Ok(())
    }

    async fn begin_checkout(&self, cart_id: CartId, correlation_id: CorrelationId) -> Result<Cart> {
        let mut carts = self.carts.write().await;
        let cart = carts.get_mut(&cart_id).ok_or(CartError::NotFound(cart_id))?;
        cart.begin_checkout(correlation_id)?;
        Ok(cart.clone())
    }

    async fn apply_outcome(
        &self,
        correlation_id: CorrelationId,
        target: CartStatus,
    ) -> Result<Option<Cart>> {
        let mut carts = self.carts.write().await;
        let changed = carts
            .values_mut()
            .find(|c| c.checkout_correlation_id == Some(correlation_id))
            .filter(|c| c.status.can_transition_to(target));

        Ok(changed.map(|cart| {
            cart.apply_outcome(correlation_id, target);
            cart.clone()
        }))
    }
}
