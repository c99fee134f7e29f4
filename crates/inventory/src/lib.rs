//! Inventory domain: stock levels, reservations and their lifecycle.
//!
//! `available = total_stock - Σ quantity of reserved rows`. A reservation
//! leaves `reserved` exactly once, by release, expiry or fulfilment.

pub mod error;
pub mod ledger;
pub mod memory;
pub mod postgres;
pub mod reactor;
pub mod reservation;
pub mod store;
pub mod sweeper;

pub use error::{InventoryError, Result};
pub use ledger::{DEFAULT_RESERVATION_TTL, EXPIRED_REASON, InventoryLedger};
pub use memory::InMemoryInventoryStore;
pub use postgres::PostgresInventoryStore;
pub use reactor::InventoryReactor;
pub use reservation::{Reservation, ReservationRequest, ReservationStatus, StockLevel};
pub use store::{InventoryStore, ReleaseOutcome, ReserveOutcome};
pub use sweeper::ReservationSweeper;
