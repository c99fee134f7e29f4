use std::sync::Arc;

use async_trait::async_trait;
use common::CorrelationId;

use crate::envelope::EventEnvelope;
use crate::error::{HandlerError, Result};
use crate::events::DomainEvent;

/// Consumer callback invoked once per delivered message.
///
/// `Ok` acknowledges the message; `Err` routes it to the queue's dead-letter
/// queue. Channels never retry on their own.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, body: &[u8]) -> std::result::Result<(), HandlerError>;
}

/// A durable, topic-routed publish/subscribe transport.
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Publishes `envelope` to `topic` with `routing_key`.
    ///
    /// Returns only once the broker has acknowledged the message, or fails
    /// once the channel's publish timeout elapses.
    async fn publish(&self, topic: &str, routing_key: &str, envelope: &EventEnvelope)
    -> Result<()>;

    /// Registers the handler for `queue`. At most one handler per queue.
    async fn subscribe(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Starts one background consumer task per subscribed queue.
    async fn start_consuming(&self) -> Result<()>;
}

/// Typed publishing on top of an [`EventChannel`].
#[derive(Clone)]
pub struct EventPublisher {
    channel: Arc<dyn EventChannel>,
}

impl EventPublisher {
    pub fn new(channel: Arc<dyn EventChannel>) -> Self {
        Self { channel }
    }

    /// Wraps `event` in an envelope and publishes it on its own topic.
    ///
    /// Returns the envelope that was sent.
    #[tracing::instrument(skip(self, event), fields(event_type = E::EVENT_TYPE, %correlation_id))]
    pub async fn publish<E: DomainEvent>(
        &self,
        correlation_id: CorrelationId,
        event: &E,
    ) -> Result<EventEnvelope> {
        let envelope = EventEnvelope::wrap(correlation_id, event)?;
        self.channel
            .publish(E::TOPIC, E::ROUTING_KEY, &envelope)
            .await?;

        metrics::counter!("events_published_total", "event_type" => E::EVENT_TYPE).increment(1);
        tracing::debug!(event_id = %envelope.event_id, "event published");
        Ok(envelope)
    }

    /// Returns the underlying channel.
    pub fn channel(&self) -> &Arc<dyn EventChannel> {
        &self.channel
    }
}
