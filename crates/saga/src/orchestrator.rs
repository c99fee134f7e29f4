//! The checkout saga orchestrator.
//!
//! The only writer of saga status. Every handler reloads the saga, applies
//! one step of the state machine and writes it back with the version it
//! read; a lost race surfaces as a transient error and the step is retried
//! against the fresh state.
//!
//! Events that must not be lost across a failed publish are published
//! before the saga advances past the state that would republish them.
//! Failures the orchestrator decides on its own go the other way: the
//! decision is stored first and the sweeper republishes a terminal event
//! that never arrived.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CorrelationId, OrderId, ReservationId, order_total};
use idempotency::{EventHandler, IdempotencyGuard, IdempotentDispatcher};
use messaging::{
    CartCheckoutInitiated, EventEnvelope, EventPublisher, HandlerError, OrderCancelled,
    OrderConfirmed, OrderCreated, OrderFailed, OrderLine, OrderPlaced, RetryPolicy,
    StockReleased, StockReserved,
};

use crate::{
    CompensationAction, CompensationEntry, CreateOutcome, FailureKind, Order, OrderReservation,
    OrderStatus, ReleaseReservation, Result, SagaError, SagaFailure, SagaPayload, SagaState,
    SagaStatus, SagaStore,
};

/// Reason carried by `OrderFailed` when inventory never confirmed every
/// line in time.
pub const RESERVATION_TIMEOUT_REASON: &str = "reservation_timeout";

/// Reason carried by `OrderFailed` when a hold expired before the order was
/// confirmed.
pub const RESERVATION_EXPIRED_REASON: &str = "reservation_expired";

/// `StockReleased` reason inventory uses for expired holds.
const STOCK_EXPIRED: &str = "expired";

/// Deadlines applied by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SagaConfig {
    /// How long a saga may wait for its reservations.
    pub saga_timeout: Duration,
    /// How long compensations may stay unconfirmed once compensation starts.
    pub compensation_timeout: Duration,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            saga_timeout: Duration::from_secs(15 * 60),
            compensation_timeout: Duration::from_secs(5 * 60),
        }
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52))
}

pub struct SagaOrchestrator {
    store: Arc<dyn SagaStore>,
    publisher: EventPublisher,
    config: SagaConfig,
}

impl SagaOrchestrator {
    pub fn new(
        store: Arc<dyn SagaStore>,
        publisher: EventPublisher,
        config: SagaConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            publisher,
            config,
        })
    }

    pub fn store(&self) -> &Arc<dyn SagaStore> {
        &self.store
    }

    /// Builds the dispatcher to subscribe on the orders queue.
    ///
    /// `OrderCreated` and `OrderPlaced` also arrive there; they are the
    /// orchestrator's own output and fall through as unknown types.
    pub fn dispatcher(
        self: &Arc<Self>,
        guard: IdempotencyGuard,
        retry: RetryPolicy,
    ) -> IdempotentDispatcher {
        IdempotentDispatcher::new(guard)
            .with_retry(retry)
            .on::<CartCheckoutInitiated>("start_saga", self.clone())
            .on::<StockReserved>("record_reservation", self.clone())
            .on::<StockReleased>("confirm_release", self.clone())
            .on::<OrderConfirmed>("complete_saga", self.clone())
            .on::<OrderFailed>("compensate", self.clone())
            .on::<OrderCancelled>("compensate", self.clone())
    }

    async fn load(&self, correlation_id: CorrelationId) -> Result<SagaState> {
        self.store
            .get(correlation_id)
            .await?
            .ok_or(SagaError::SagaNotFound(correlation_id))
    }

    /// Creates the order and the saga, then asks inventory for stock.
    ///
    /// A repeated checkout for a known correlation id never creates a
    /// second order; if the first attempt stopped before `OrderCreated`
    /// went out it is republished with the stored ids.
    #[tracing::instrument(skip(self, event), fields(cart_id = %event.cart_id, order_id))]
    pub async fn start(
        &self,
        correlation_id: CorrelationId,
        event: CartCheckoutInitiated,
    ) -> Result<String> {
        if let Some(existing) = self.store.get(correlation_id).await? {
            return self.resume_start(existing).await;
        }
        if event.items.is_empty() {
            tracing::warn!("checkout without items, no saga started");
            return Ok("rejected:empty".into());
        }

        let now = Utc::now();
        let order_id = OrderId::new();
        tracing::Span::current().record("order_id", tracing::field::display(order_id));

        let total = order_total(&event.items);
        if total != event.total {
            tracing::warn!(
                claimed = %event.total,
                computed = %total,
                "checkout total disagrees with its items"
            );
        }
        let items: Vec<OrderLine> = event
            .items
            .iter()
            .map(|item| OrderLine {
                product_id: item.product_id,
                quantity: item.quantity,
                unit_price: item.unit_price,
                reservation_id: ReservationId::new(),
            })
            .collect();

        let mut saga = SagaState::new(
            correlation_id,
            event.cart_id,
            event.user_id,
            SagaPayload {
                items: items.clone(),
                total,
                ..Default::default()
            },
            now,
            to_chrono(self.config.saga_timeout),
        );
        saga.order_id = Some(order_id);
        saga.transition(SagaStatus::OrderCreated)?;
        let order = Order::pending(
            order_id,
            correlation_id,
            event.user_id,
            event.cart_id,
            items,
            total,
            now,
        );

        match self.store.create(&saga, &order).await? {
            CreateOutcome::Created(saga) => {
                metrics::counter!("saga_started_total").increment(1);
                tracing::info!(%total, lines = saga.payload.items.len(), "saga started");
                self.request_reservations(saga).await
            }
            CreateOutcome::Existing(existing) => self.resume_start(existing).await,
        }
    }

    async fn resume_start(&self, saga: SagaState) -> Result<String> {
        if saga.status == SagaStatus::OrderCreated {
            tracing::info!("republishing reservation request");
            return self.request_reservations(saga).await;
        }
        tracing::debug!(status = %saga.status, "saga already started");
        Ok("already_started".into())
    }

    async fn request_reservations(&self, mut saga: SagaState) -> Result<String> {
        let order_id = saga
            .order_id
            .ok_or(SagaError::MissingOrder(saga.correlation_id))?;
        let event = OrderCreated {
            order_id,
            user_id: saga.user_id,
            total: saga.payload.total,
            items: saga.payload.items.clone(),
        };
        self.publisher.publish(saga.correlation_id, &event).await?;

        saga.transition(SagaStatus::CheckingInventory)?;
        self.store.update(&saga, Utc::now()).await?;
        Ok(SagaStatus::CheckingInventory.as_str().into())
    }

    /// Records a confirmed reservation and places the order once every line
    /// is held.
    #[tracing::instrument(skip(self, event), fields(
        order_id = %event.order_id,
        reservation_id = %event.reservation_id,
    ))]
    pub async fn on_stock_reserved(
        &self,
        correlation_id: CorrelationId,
        event: StockReserved,
    ) -> Result<String> {
        let now = Utc::now();
        let mut saga = self.load(correlation_id).await?;
        let order_id = saga
            .order_id
            .ok_or(SagaError::MissingOrder(correlation_id))?;
        if order_id != event.order_id {
            tracing::warn!(saga_order = %order_id, "reservation for another order, ignored");
            return Ok("ignored:foreign_order".into());
        }
        if !saga.payload.expects(event.reservation_id) {
            tracing::warn!("reservation does not match any order line");
        }

        let mirror = OrderReservation::reserved(
            event.reservation_id,
            order_id,
            event.product_id,
            event.quantity,
            now,
        );
        let entry = CompensationEntry::release_reservation(
            order_id,
            correlation_id,
            ReleaseReservation {
                reservation_id: event.reservation_id,
                product_id: event.product_id,
                quantity: event.quantity,
            },
            now,
        )?;
        let recorded = self.store.record_reservation(mirror, entry).await?;

        match saga.status {
            SagaStatus::Pending | SagaStatus::OrderCreated | SagaStatus::CheckingInventory => {
                let newly = saga.record_reservation(event.reservation_id);
                if saga.status == SagaStatus::OrderCreated {
                    // OrderCreated went out but the advance was not stored.
                    saga.transition(SagaStatus::CheckingInventory)?;
                } else if !newly {
                    return Ok("duplicate".into());
                }

                if saga.payload.all_reserved() {
                    self.store
                        .set_order_status(order_id, OrderStatus::Placed, now)
                        .await?;
                    let placed = OrderPlaced {
                        order_id,
                        user_id: saga.user_id,
                        total: saga.payload.total,
                        items: saga.payload.items.clone(),
                    };
                    self.publisher.publish(correlation_id, &placed).await?;
                    saga.transition(SagaStatus::OrderPlaced)?;
                    tracing::info!("all lines reserved, order placed");
                }

                let saga = self.store.update(&saga, now).await?;
                if saga.status == SagaStatus::OrderPlaced {
                    Ok(SagaStatus::OrderPlaced.as_str().into())
                } else {
                    Ok(format!(
                        "reserved:{}/{}",
                        saga.payload.reserved.len(),
                        saga.payload.items.len()
                    ))
                }
            }
            SagaStatus::CompensationInProgress | SagaStatus::Failed | SagaStatus::Cancelled => {
                let still_reserved = recorded.mirror.is_reserved();
                self.on_late_reservation(saga, event.reservation_id, still_reserved, now)
                    .await
            }
            SagaStatus::OrderPlaced | SagaStatus::OrderConfirmed | SagaStatus::Completed => {
                tracing::debug!(status = %saga.status, "reservation already accounted for");
                Ok("duplicate".into())
            }
        }
    }

    /// A reservation confirmed after the saga gave up. The terminal event
    /// is published again so inventory releases the hold.
    async fn on_late_reservation(
        &self,
        mut saga: SagaState,
        reservation_id: ReservationId,
        still_reserved: bool,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let order_id = saga
            .order_id
            .ok_or(SagaError::MissingOrder(saga.correlation_id))?;
        let Some(failure) = saga.payload.failure.clone() else {
            return Err(SagaError::InvalidTransition {
                from: saga.status,
                to: SagaStatus::Failed,
            });
        };

        saga.record_reservation(reservation_id);
        saga.extend_deadline(now, to_chrono(self.config.compensation_timeout));
        self.store.update(&saga, now).await?;

        if !still_reserved {
            return Ok("late:released".into());
        }
        tracing::warn!(
            %order_id,
            kind = ?failure.kind,
            "reservation arrived after saga ended, releasing again"
        );
        self.publish_terminal(saga.correlation_id, order_id, &failure)
            .await?;
        Ok("late:release_requested".into())
    }

    async fn publish_terminal(
        &self,
        correlation_id: CorrelationId,
        order_id: OrderId,
        failure: &SagaFailure,
    ) -> Result<()> {
        let reason = failure.reason.clone();
        match failure.kind {
            FailureKind::Failed => {
                self.publisher
                    .publish(correlation_id, &OrderFailed { order_id, reason })
                    .await?;
            }
            FailureKind::Cancelled => {
                self.publisher
                    .publish(correlation_id, &OrderCancelled { order_id, reason })
                    .await?;
            }
        }
        Ok(())
    }

    /// Marks the local mirror released and completes the matching
    /// compensation entry.
    ///
    /// A hold that expired before the order was confirmed fails the saga.
    #[tracing::instrument(skip(self, event), fields(
        reservation_id = %event.reservation_id,
        reason = %event.reason,
    ))]
    pub async fn on_stock_released(
        &self,
        correlation_id: CorrelationId,
        event: StockReleased,
    ) -> Result<String> {
        let now = Utc::now();
        let saga = self.load(correlation_id).await?;

        let released = self
            .store
            .release_reservation(event.reservation_id, now)
            .await?;
        let completed = self
            .store
            .complete_compensation(event.reservation_id, now)
            .await?;
        tracing::debug!(mirror_released = released.is_some(), completed, "release recorded");

        if event.reason == STOCK_EXPIRED && saga.payload.expects(event.reservation_id) {
            if let Some(outcome) = self.on_hold_expired(saga).await? {
                return Ok(outcome);
            }
        }

        let tag = if completed { "compensated" } else { "released" };
        Ok(tag.into())
    }

    /// Fails the order when one of its holds expired before confirmation.
    /// Returns `None` when the saga already failed or was cancelled.
    async fn on_hold_expired(&self, saga: SagaState) -> Result<Option<String>> {
        let order_id = saga
            .order_id
            .ok_or(SagaError::MissingOrder(saga.correlation_id))?;
        match saga.status {
            SagaStatus::Pending
            | SagaStatus::OrderCreated
            | SagaStatus::CheckingInventory
            | SagaStatus::OrderPlaced
            | SagaStatus::OrderConfirmed => {
                tracing::warn!(%order_id, "reservation expired before confirmation, failing order");
                self.abandon(saga, FailureKind::Failed, RESERVATION_EXPIRED_REASON)
                    .await?;
                Ok(Some("expired:order_failed".into()))
            }
            SagaStatus::Completed => {
                tracing::error!(
                    %order_id,
                    "hold expired after the order completed, stock was not fulfilled"
                );
                metrics::counter!("confirmed_order_unfulfilled_total").increment(1);
                Ok(Some("expired:after_completion".into()))
            }
            SagaStatus::CompensationInProgress | SagaStatus::Failed | SagaStatus::Cancelled => {
                Ok(None)
            }
        }
    }

    /// Stores the decision to fail or cancel, then publishes the terminal
    /// event.
    ///
    /// The saga is `compensation_in_progress` before the event is out, so a
    /// confirmation handled in between is refused.
    pub async fn abandon(
        &self,
        saga: SagaState,
        kind: FailureKind,
        reason: &str,
    ) -> Result<SagaState> {
        let order_id = saga
            .order_id
            .ok_or(SagaError::MissingOrder(saga.correlation_id))?;
        let failure = SagaFailure {
            kind,
            reason: reason.to_string(),
        };
        let saga = self
            .begin_compensation(saga, failure.clone(), Utc::now())
            .await?;
        self.publish_terminal(saga.correlation_id, order_id, &failure)
            .await?;
        Ok(saga)
    }

    /// Publishes the stored terminal event again and pushes the
    /// compensation deadline out.
    pub async fn republish_terminal(&self, mut saga: SagaState) -> Result<SagaState> {
        let order_id = saga
            .order_id
            .ok_or(SagaError::MissingOrder(saga.correlation_id))?;
        let Some(failure) = saga.payload.failure.clone() else {
            return Err(SagaError::InvalidTransition {
                from: saga.status,
                to: SagaStatus::Failed,
            });
        };
        self.publish_terminal(saga.correlation_id, order_id, &failure)
            .await?;

        let now = Utc::now();
        saga.extend_deadline(now, to_chrono(self.config.compensation_timeout));
        self.store.update(&saga, now).await
    }

    async fn begin_compensation(
        &self,
        mut saga: SagaState,
        failure: SagaFailure,
        now: DateTime<Utc>,
    ) -> Result<SagaState> {
        saga.transition(SagaStatus::CompensationInProgress)?;
        saga.payload.failure = Some(failure);
        saga.extend_deadline(now, to_chrono(self.config.compensation_timeout));
        self.store.update(&saga, now).await
    }

    /// Confirms a placed order and completes the saga.
    ///
    /// A confirmation for an order that lost one of its holds fails the
    /// order instead.
    #[tracing::instrument(skip(self, event), fields(order_id = %event.order_id))]
    pub async fn on_order_confirmed(
        &self,
        correlation_id: CorrelationId,
        event: OrderConfirmed,
    ) -> Result<String> {
        let now = Utc::now();
        let mut saga = self.load(correlation_id).await?;
        if saga.status != SagaStatus::OrderPlaced {
            tracing::info!(status = %saga.status, "confirmation ignored");
            return Ok(format!("ignored:{}", saga.status));
        }
        if !self.store.holds_intact(&saga).await? {
            tracing::warn!("confirmation after a hold lapsed, failing order");
            self.abandon(saga, FailureKind::Failed, RESERVATION_EXPIRED_REASON)
                .await?;
            return Ok("lapsed:order_failed".into());
        }

        self.store
            .set_order_status(event.order_id, OrderStatus::Confirmed, now)
            .await?;
        saga.transition(SagaStatus::OrderConfirmed)?;
        saga.transition(SagaStatus::Completed)?;
        let saga = self.store.update(&saga, now).await?;

        metrics::counter!("saga_completed_total").increment(1);
        metrics::histogram!("saga_duration_seconds")
            .record((now - saga.created_at).num_milliseconds() as f64 / 1000.0);
        tracing::info!("saga completed");
        Ok(SagaStatus::Completed.as_str().into())
    }

    /// Fails or cancels the saga and walks its compensation log.
    ///
    /// The first failure wins; a second terminal event for the same saga is
    /// a no-op.
    #[tracing::instrument(skip(self, reason))]
    pub async fn compensate(
        &self,
        correlation_id: CorrelationId,
        order_id: OrderId,
        kind: FailureKind,
        reason: String,
    ) -> Result<String> {
        let now = Utc::now();
        let mut saga = self.load(correlation_id).await?;
        if saga.order_id != Some(order_id) {
            tracing::warn!("terminal event for another order, ignored");
            return Ok("ignored:foreign_order".into());
        }
        if saga.status.is_terminal() {
            tracing::debug!(status = %saga.status, "saga already terminal");
            return Ok(format!("ignored:{}", saga.status));
        }

        if saga.status != SagaStatus::CompensationInProgress {
            saga = self
                .begin_compensation(saga, SagaFailure { kind, reason }, now)
                .await?;
        }
        let failure = saga.payload.failure.clone().ok_or(SagaError::InvalidTransition {
            from: saga.status,
            to: kind.saga_status(),
        })?;

        let awaiting = self.walk_compensation_log(order_id).await?;

        self.store
            .set_order_status(order_id, failure.kind.order_status(), now)
            .await?;
        saga.transition(failure.kind.saga_status())?;
        let saga = self.store.update(&saga, now).await?;

        match failure.kind {
            FailureKind::Failed => metrics::counter!("saga_failed_total").increment(1),
            FailureKind::Cancelled => metrics::counter!("saga_cancelled_total").increment(1),
        }
        tracing::info!(
            status = %saga.status,
            reason = %failure.reason,
            awaiting,
            "saga compensated"
        );
        Ok(format!("{}:{awaiting}", saga.status))
    }

    /// Visits pending entries newest first. Returns how many wait on
    /// another domain's confirmation.
    async fn walk_compensation_log(&self, order_id: OrderId) -> Result<usize> {
        let entries = self.store.compensations(order_id).await?;
        let mut awaiting = 0;
        for entry in entries.iter().rev().filter(|e| e.is_pending()) {
            match entry.compensation_event {
                CompensationAction::ReleaseReservation => {
                    tracing::debug!(
                        entry_id = entry.id,
                        reservation_id = ?entry.reservation_id(),
                        "awaiting release from inventory"
                    );
                }
            }
            if entry.compensation_event.is_remote() {
                awaiting += 1;
            }
        }
        Ok(awaiting)
    }
}

#[async_trait]
impl EventHandler<CartCheckoutInitiated> for SagaOrchestrator {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        event: CartCheckoutInitiated,
    ) -> std::result::Result<String, HandlerError> {
        Ok(self.start(envelope.correlation_id, event).await?)
    }
}

#[async_trait]
impl EventHandler<StockReserved> for SagaOrchestrator {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        event: StockReserved,
    ) -> std::result::Result<String, HandlerError> {
        Ok(self.on_stock_reserved(envelope.correlation_id, event).await?)
    }
}

#[async_trait]
impl EventHandler<StockReleased> for SagaOrchestrator {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        event: StockReleased,
    ) -> std::result::Result<String, HandlerError> {
        Ok(self.on_stock_released(envelope.correlation_id, event).await?)
    }
}

#[async_trait]
impl EventHandler<OrderConfirmed> for SagaOrchestrator {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        event: OrderConfirmed,
    ) -> std::result::Result<String, HandlerError> {
        Ok(self.on_order_confirmed(envelope.correlation_id, event).await?)
    }
}

#[async_trait]
impl EventHandler<OrderFailed> for SagaOrchestrator {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        event: OrderFailed,
    ) -> std::result::Result<String, HandlerError> {
        Ok(self
            .compensate(envelope.correlation_id, event.order_id, FailureKind::Failed, event.reason)
            .await?)
    }
}

#[async_trait]
impl EventHandler<OrderCancelled> for SagaOrchestrator {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        event: OrderCancelled,
    ) -> std::result::Result<String, HandlerError> {
        Ok(self
            .compensate(
                envelope.correlation_id,
                event.order_id,
                FailureKind::Cancelled,
                event.reason,
            )
            .await?)
    }
}
