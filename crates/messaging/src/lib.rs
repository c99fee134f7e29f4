//! Messaging layer for the checkout saga.
//!
//! Every message is an [`EventEnvelope`] published on one of three topic
//! exchanges and routed into per-domain queues by the [`Topology`].
//! [`InMemoryBroker`] implements the same routing, dead-lettering and TTL
//! rules as the RabbitMQ-backed `AmqpChannel` (feature `amqp`).

pub mod channel;
pub mod envelope;
pub mod error;
pub mod events;
pub mod memory;
pub mod retry;
pub mod routing;
pub mod topology;

#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(feature = "amqp")]
pub use amqp::AmqpChannel;
pub use channel::{EventChannel, EventPublisher, MessageHandler};
pub use envelope::{EventEnvelope, EventEnvelopeBuilder, EventId, SCHEMA_VERSION};
pub use error::{ChannelError, HandlerError, Result};
pub use events::{
    CartCheckoutInitiated, DomainEvent, OrderCancelled, OrderConfirmed, OrderCreated, OrderFailed,
    OrderLine, OrderPlaced, StockReleased, StockReserved,
};
pub use memory::{DeliveryOutcome, InMemoryBroker, PublishedMessage, QueuedMessage};
pub use retry::RetryPolicy;
pub use topology::{Binding, Domain, QueueSpec, TopicSpec, Topology};
