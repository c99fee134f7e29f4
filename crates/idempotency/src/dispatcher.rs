//! Event-type dispatch with duplicate suppression.
//!
//! Every consuming domain registers one typed handler per event type it
//! cares about. Deliveries of other event types are acknowledged and
//! dropped.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use messaging::{DomainEvent, EventEnvelope, HandlerError, MessageHandler, RetryPolicy};
use tracing::Instrument;

use crate::IdempotencyGuard;

/// Typed handler for one event type.
///
/// Returns a short result tag stored in the idempotency record.
#[async_trait]
pub trait EventHandler<E: DomainEvent>: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope, event: E) -> Result<String, HandlerError>;
}

#[async_trait]
trait Route: Send + Sync {
    fn action(&self) -> &'static str;
    async fn call(&self, envelope: &EventEnvelope) -> Result<String, HandlerError>;
}

struct TypedRoute<E> {
    action: &'static str,
    handler: Arc<dyn EventHandler<E>>,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E: DomainEvent + 'static> Route for TypedRoute<E> {
    fn action(&self) -> &'static str {
        self.action
    }

    async fn call(&self, envelope: &EventEnvelope) -> Result<String, HandlerError> {
        let event: E = envelope.decode()?;
        self.handler.handle(envelope, event).await
    }
}

/// [`MessageHandler`] that decodes envelopes, skips already-processed
/// events, routes by `event_type` and records the outcome.
pub struct IdempotentDispatcher {
    guard: IdempotencyGuard,
    retry: RetryPolicy,
    routes: HashMap<&'static str, Arc<dyn Route>>,
}

impl IdempotentDispatcher {
    pub fn new(guard: IdempotencyGuard) -> Self {
        Self {
            guard,
            retry: RetryPolicy::default(),
            routes: HashMap::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Routes `E` to `handler`, recording completions under `action`.
    pub fn on<E: DomainEvent + 'static>(
        mut self,
        action: &'static str,
        handler: Arc<dyn EventHandler<E>>,
    ) -> Self {
        self.routes.insert(
            E::EVENT_TYPE,
            Arc::new(TypedRoute {
                action,
                handler,
                _event: PhantomData,
            }),
        );
        self
    }

    /// Event types with a registered handler.
    pub fn event_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.routes.keys().copied()
    }

    async fn process(&self, envelope: &EventEnvelope, route: &dyn Route) -> Result<(), HandlerError> {
        if self.guard.is_processed(envelope.event_id).await? {
            metrics::counter!("events_duplicate_total", "service" => self.guard.service_name().to_string())
                .increment(1);
            tracing::debug!("duplicate delivery skipped");
            return Ok(());
        }

        let result = route.call(envelope).await?;

        let inserted = self
            .guard
            .record_processed(envelope.event_id, route.action(), &result)
            .await?;
        if !inserted {
            tracing::debug!("event recorded concurrently by another delivery");
        }
        tracing::debug!(action = route.action(), %result, "event processed");
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for IdempotentDispatcher {
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError> {
        let envelope = match EventEnvelope::from_bytes(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(service = self.guard.service_name(), error = %e, "malformed message");
                return Err(e.into());
            }
        };

        let span = tracing::info_span!(
            "handle_event",
            service = self.guard.service_name(),
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            correlation_id = %envelope.correlation_id,
        );

        let Some(route) = self.routes.get(envelope.event_type.as_str()).cloned() else {
            span.in_scope(|| tracing::info!("no handler for event type, acknowledging"));
            return Ok(());
        };

        async {
            let result = self
                .retry
                .run(|| self.process(&envelope, route.as_ref()))
                .await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "event handling failed");
            }
            result
        }
        .instrument(span)
        .await
    }
}
