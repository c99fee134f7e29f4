use std::sync::Arc;

use common::{CartId, CorrelationId};
use messaging::{CartCheckoutInitiated, EventPublisher};

use crate::{Cart, CartError, CartStatus, CartStore, Result};

/// Starts checkouts. Each checkout mints the correlation id that names its
/// saga from here on.
#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn CartStore>,
    publisher: EventPublisher,
}

impl CheckoutService {
    pub fn new(store: Arc<dyn CartStore>, publisher: EventPublisher) -> Self {
        Self { store, publisher }
    }

    pub fn store(&self) -> &Arc<dyn CartStore> {
        &self.store
    }

    /// Marks the cart `checkout_pending` and publishes
    /// `CartCheckoutInitiated`.
    ///
    /// A cart that is already `checkout_pending` gets its event published
    /// again under the correlation id it already holds. The saga starts at
    /// most once per correlation id, so a failed publish is recovered by
    /// checking out again.
    #[tracing::instrument(skip(self), fields(correlation_id))]
    pub async fn checkout(&self, cart_id: CartId) -> Result<CorrelationId> {
        let correlation_id = CorrelationId::new();
        let (cart, correlation_id) = match self.store.begin_checkout(cart_id, correlation_id).await
        {
            Ok(cart) => (cart, correlation_id),
            Err(CartError::CheckoutInProgress(_)) => self.pending_checkout(cart_id).await?,
            Err(e) => return Err(e),
        };
        tracing::Span::current().record("correlation_id", tracing::field::display(correlation_id));

        let event = CartCheckoutInitiated {
            cart_id: cart.cart_id,
            user_id: cart.user_id,
            total: cart.total(),
            items: cart.items.clone(),
        };

        if let Err(e) = self.publisher.publish(correlation_id, &event).await {
            tracing::error!(error = %e, "checkout publish failed, cart stays pending");
            return Err(e.into());
        }

        metrics::counter!("checkouts_initiated_total").increment(1);
        tracing::info!(total = %cart.total(), lines = cart.items.len(), "checkout initiated");
        Ok(correlation_id)
    }

    async fn pending_checkout(&self, cart_id: CartId) -> Result<(Cart, CorrelationId)> {
        let cart = self
            .store
            .get(cart_id)
            .await?
            .ok_or(CartError::NotFound(cart_id))?;
        match (cart.status, cart.checkout_correlation_id) {
            (CartStatus::CheckoutPending, Some(correlation_id)) => {
                tracing::info!(%correlation_id, "republishing pending checkout");
                Ok((cart, correlation_id))
            }
            _ => Err(CartError::CheckoutInProgress(cart_id)),
        }
    }

    pub async fn get(&self, cart_id: CartId) -> Result<Option<Cart>> {
        self.store.get(cart_id).await
    }

    /// Replaces the cart's contents. Only allowed while it is active.
    pub async fn put(&self, cart: Cart) -> Result<Cart> {
        if let Some(existing) = self.store.get(cart.cart_id).await? {
            match existing.status {
                CartStatus::Active => {}
                CartStatus::CheckoutPending => {
                    return Err(CartError::CheckoutInProgress(cart.cart_id));
                }
                CartStatus::CheckedOut => {
                    return Err(CartError::AlreadyCheckedOut(cart.cart_id));
                }
            }
        }
        self.store.save(&cart).await?;
        Ok(cart)
    }
}
