//! Identifiers and value objects shared by every checkout domain.
//!
//! Catalog entities (carts, users, products) are owned by CRUD services
//! outside this workspace and use integer surrogate keys. Identifiers minted
//! by the saga itself (orders, correlations, reservations) are UUIDs.

pub mod ids;
pub mod money;

pub use ids::{CartId, CorrelationId, OrderId, ProductId, ReservationId, UserId};
pub use money::{LineItem, Money, order_total};
