//! Cart domain: owns carts, starts checkouts and follows their outcome.

pub mod checkout;
pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod reactor;
pub mod store;

pub use checkout::CheckoutService;
pub use error::{CartError, Result};
pub use memory::InMemoryCartStore;
pub use model::{Cart, CartStatus};
pub use postgres::PostgresCartStore;
pub use reactor::CartReactor;
pub use store::CartStore;
