//! Idempotent event processing.
//!
//! Delivery is at-least-once, so every consumer records each `event_id` it
//! finished processing under its own service name and skips repeats.

pub mod dispatcher;
pub mod error;
pub mod guard;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod store;

pub use dispatcher::{EventHandler, IdempotentDispatcher};
pub use error::{IdempotencyError, Result};
pub use guard::IdempotencyGuard;
pub use memory::InMemoryIdempotencyStore;
pub use postgres::PostgresIdempotencyStore;
pub use record::IdempotencyRecord;
pub use store::IdempotencyStore;
