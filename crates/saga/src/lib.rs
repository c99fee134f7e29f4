//! Order domain: the checkout saga orchestrator and the state it owns.
//!
//! The orchestrator reacts to cart and inventory events, drives each saga
//! through [`SagaStatus`], and records the compensations needed to undo a
//! partially completed checkout.

pub mod compensation;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod order;
pub mod postgres;
pub mod saga;
pub mod service;
pub mod state;
pub mod store;
pub mod sweeper;

pub use compensation::{
    CompensationAction, CompensationEntry, CompensationStatus, ReleaseReservation,
};
pub use error::{Result, SagaError};
pub use memory::InMemorySagaStore;
pub use orchestrator::{
    RESERVATION_EXPIRED_REASON, RESERVATION_TIMEOUT_REASON, SagaConfig, SagaOrchestrator,
};
pub use order::{MirrorStatus, Order, OrderReservation, OrderStatus};
pub use postgres::PostgresSagaStore;
pub use saga::{CHECKOUT_SAGA_TYPE, FailureKind, SagaFailure, SagaPayload, SagaState};
pub use service::{DEFAULT_CANCEL_REASON, OrderService, SagaView};
pub use state::SagaStatus;
pub use store::{CreateOutcome, RecordedReservation, SagaStore};
pub use sweeper::{SagaTimeoutSweeper, SweepReport};
