//! Saga error types.

use common::{CorrelationId, OrderId};
use messaging::{ChannelError, HandlerError};
use thiserror::Error;

use crate::order::OrderStatus;
use crate::state::SagaStatus;

/// Errors that can occur in the order domain.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No saga exists for the correlation id (yet).
    #[error("Saga not found: {0}")]
    SagaNotFound(CorrelationId),

    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("Saga {0} has no order")]
    MissingOrder(CorrelationId),

    /// The state machine does not allow this move.
    #[error("Invalid saga transition: {from} -> {to}")]
    InvalidTransition { from: SagaStatus, to: SagaStatus },

    /// The order already reached a final status.
    #[error("Order {order_id} is already {status}")]
    OrderTerminal {
        order_id: OrderId,
        status: OrderStatus,
    },

    /// Confirmation requires a placed order.
    #[error("Order {order_id} is {status}, expected placed")]
    OrderNotPlaced {
        order_id: OrderId,
        status: OrderStatus,
    },

    /// A failure or cancellation is already being compensated.
    #[error("Order {0} is being compensated")]
    CompensationPending(OrderId),

    /// At least one of the order's holds was released or expired.
    #[error("Order {0} no longer holds all of its stock")]
    ReservationLapsed(OrderId),

    /// Another writer updated the saga first.
    #[error("Concurrency conflict on saga {correlation_id}: expected version {expected}")]
    ConcurrencyConflict {
        correlation_id: CorrelationId,
        expected: i64,
    },

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl SagaError {
    /// Errors worth redelivering: infrastructure hiccups, lost races, and
    /// events that overtook the saga they belong to.
    pub fn is_transient(&self) -> bool {
        match self {
            SagaError::SagaNotFound(_)
            | SagaError::ConcurrencyConflict { .. }
            | SagaError::Database(_) => true,
            SagaError::Channel(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<SagaError> for HandlerError {
    fn from(err: SagaError) -> Self {
        if err.is_transient() {
            HandlerError::transient(err)
        } else {
            HandlerError::permanent(err)
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
