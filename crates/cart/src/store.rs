use async_trait::async_trait;
use common::{CartId, CorrelationId};

use crate::{Cart, CartStatus, Result};

#[async_trait]
pub trait CartStore: Send + Sync {
    async fn get(&self, cart_id: CartId) -> Result<Option<Cart>>;

    /// Inserts or replaces the whole cart.
    async fn save(&self, cart: &Cart) -> Result<()>;

    /// Atomically applies [`Cart::begin_checkout`].
    async fn begin_checkout(&self, cart_id: CartId, correlation_id: CorrelationId) -> Result<Cart>;

    /// Atomically applies [`Cart::apply_outcome`] to the cart whose current
    /// checkout is `correlation_id`. Returns the cart if it changed.
    async fn apply_outcome(
        &self,
        correlation_id: CorrelationId,
        target: CartStatus,
    ) -> Result<Option<Cart>>;
}
