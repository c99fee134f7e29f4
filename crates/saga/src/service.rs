use std::sync::Arc;

use common::{CorrelationId, OrderId};
use messaging::{EventPublisher, OrderCancelled, OrderConfirmed};
use serde::Serialize;

use crate::{
    CompensationEntry, Order, OrderReservation, OrderStatus, Result, SagaError, SagaState,
    SagaStatus, SagaStore,
};

/// Reason used when a cancellation request does not give one.
pub const DEFAULT_CANCEL_REASON: &str = "user_requested";

/// A saga together with its order-domain bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct SagaView {
    #[serde(flatten)]
    pub saga: SagaState,
    pub compensation_entries: Vec<CompensationEntry>,
    pub reservations: Vec<OrderReservation>,
}

/// Read access and upstream signals for orders.
///
/// Cancelling and confirming only publish the corresponding event; the
/// orchestrator applies it like any other delivery.
#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn SagaStore>,
    publisher: EventPublisher,
}

impl OrderService {
    pub fn new(store: Arc<dyn SagaStore>, publisher: EventPublisher) -> Self {
        Self { store, publisher }
    }

    pub async fn order(&self, order_id: OrderId) -> Result<Order> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or(SagaError::OrderNotFound(order_id))
    }

    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, order_id: OrderId, reason: Option<String>) -> Result<Order> {
        let order = self.order(order_id).await?;
        if order.status.is_terminal() {
            return Err(SagaError::OrderTerminal {
                order_id,
                status: order.status,
            });
        }

        let reason = reason.unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());
        self.publisher
            .publish(order.correlation_id, &OrderCancelled { order_id, reason })
            .await?;
        tracing::info!(correlation_id = %order.correlation_id, "cancellation requested");
        Ok(order)
    }

    /// Publishes `OrderConfirmed` for a placed order whose holds are all
    /// still reserved and whose saga is not already compensating.
    #[tracing::instrument(skip(self))]
    pub async fn confirm(&self, order_id: OrderId) -> Result<Order> {
        let order = self.order(order_id).await?;
        if order.status != OrderStatus::Placed {
            return Err(SagaError::OrderNotPlaced {
                order_id,
                status: order.status,
            });
        }
        let saga = self
            .store
            .get(order.correlation_id)
            .await?
            .ok_or(SagaError::SagaNotFound(order.correlation_id))?;
        if saga.status == SagaStatus::CompensationInProgress {
            return Err(SagaError::CompensationPending(order_id));
        }
        if !self.store.holds_intact(&saga).await? {
            return Err(SagaError::ReservationLapsed(order_id));
        }

        self.publisher
            .publish(order.correlation_id, &OrderConfirmed { order_id })
            .await?;
        tracing::info!(correlation_id = %order.correlation_id, "confirmation published");
        Ok(order)
    }

    pub async fn saga(&self, correlation_id: CorrelationId) -> Result<SagaView> {
        let saga = self
            .store
            .get(correlation_id)
            .await?
            .ok_or(SagaError::SagaNotFound(correlation_id))?;

        let (compensation_entries, reservations) = match saga.order_id {
            Some(order_id) => (
                self.store.compensations(order_id).await?,
                self.store.reservations(order_id).await?,
            ),
            None => (Vec::new(), Vec::new()),
        };
        Ok(SagaView {
            saga,
            compensation_entries,
            reservations,
        })
    }
}
