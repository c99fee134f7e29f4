use common::{ProductId, ReservationId};
use messaging::{ChannelError, HandlerError};
use thiserror::Error;

/// Errors that can occur in the inventory domain.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// Not enough unreserved stock for the request.
    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: i64,
    },

    #[error("Unknown product: {0}")]
    UnknownProduct(ProductId),

    #[error("Reservation {0} has zero quantity")]
    EmptyReservation(ReservationId),

    #[error("Invalid reservation status: {0}")]
    InvalidStatus(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl InventoryError {
    /// Store and broker failures may succeed on redelivery.
    pub fn is_transient(&self) -> bool {
        match self {
            InventoryError::Database(_) => true,
            InventoryError::Channel(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<InventoryError> for HandlerError {
    fn from(err: InventoryError) -> Self {
        if err.is_transient() {
            HandlerError::transient(err)
        } else {
            HandlerError::permanent(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, InventoryError>;
