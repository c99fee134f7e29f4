use common::CartId;
use messaging::{ChannelError, HandlerError};
use thiserror::Error;

/// Errors that can occur in the cart domain.
#[derive(Debug, Error)]
pub enum CartError {
    #[error("Cart not found: {0}")]
    NotFound(CartId),

    #[error("Cart {0} is empty")]
    Empty(CartId),

    /// A checkout is already running for this cart.
    #[error("Cart {0} is already checking out")]
    CheckoutInProgress(CartId),

    #[error("Cart {0} is already checked out")]
    AlreadyCheckedOut(CartId),

    #[error("Invalid cart status: {0}")]
    InvalidStatus(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl CartError {
    pub fn is_transient(&self) -> bool {
        match self {
            CartError::Database(_) => true,
            CartError::Channel(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<CartError> for HandlerError {
    fn from(err: CartError) -> Self {
        if err.is_transient() {
            HandlerError::transient(err)
        } else {
            HandlerError::permanent(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, CartError>;
