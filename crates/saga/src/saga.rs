use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use common::{CartId, CorrelationId, Money, OrderId, ReservationId, UserId};
use messaging::OrderLine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CompensationAction, OrderStatus, Result, SagaError, SagaStatus};

pub const CHECKOUT_SAGA_TYPE: &str = "checkout";

/// How a saga that did not complete ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Failed,
    Cancelled,
}

impl FailureKind {
    pub fn saga_status(&self) -> SagaStatus {
        match self {
            FailureKind::Failed => SagaStatus::Failed,
            FailureKind::Cancelled => SagaStatus::Cancelled,
        }
    }

    pub fn order_status(&self) -> OrderStatus {
        match self {
            FailureKind::Failed => OrderStatus::Failed,
            FailureKind::Cancelled => OrderStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaFailure {
    pub kind: FailureKind,
    pub reason: String,
}

/// Saga-private data kept alongside the row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaPayload {
    /// Order lines with the reservation id minted for each.
    pub items: Vec<OrderLine>,
    pub total: Money,
    /// Reservations inventory has confirmed so far.
    #[serde(default)]
    pub reserved: BTreeSet<ReservationId>,
    /// Set by the first failure or cancellation; later ones do not
    /// overwrite it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<SagaFailure>,
}

impl SagaPayload {
    /// True if `reservation_id` belongs to one of the order's lines.
    pub fn expects(&self, reservation_id: ReservationId) -> bool {
        self.items.iter().any(|l| l.reservation_id == reservation_id)
    }

    pub fn all_reserved(&self) -> bool {
        self.items
            .iter()
            .all(|l| self.reserved.contains(&l.reservation_id))
    }
}

/// Persistent state of one checkout saga, keyed by its correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaState {
    pub id: Uuid,
    pub correlation_id: CorrelationId,
    pub saga_type: String,
    pub status: SagaStatus,
    pub order_id: Option<OrderId>,
    pub cart_id: CartId,
    pub user_id: UserId,
    pub payload: SagaPayload,
    /// Names of the compensations recorded so far, in order. Append only.
    pub compensation_log: Vec<String>,
    /// Bumped by every successful write; writes carry the version they read.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SagaState {
    pub fn new(
        correlation_id: CorrelationId,
        cart_id: CartId,
        user_id: UserId,
        payload: SagaPayload,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id,
            saga_type: CHECKOUT_SAGA_TYPE.to_string(),
            status: SagaStatus::Pending,
            order_id: None,
            cart_id,
            user_id,
            payload,
            compensation_log: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
            expires_at: now + timeout,
        }
    }

    /// Moves to `next` if the state machine allows it.
    pub fn transition(&mut self, next: SagaStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SagaError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Marks a reservation confirmed. Returns false if it was already known.
    pub fn record_reservation(&mut self, reservation_id: ReservationId) -> bool {
        if !self.payload.reserved.insert(reservation_id) {
            return false;
        }
        self.compensation_log
            .push(CompensationAction::ReleaseReservation.to_string());
        true
    }

    /// Pushes the deadline out to at least `now + window`.
    pub fn extend_deadline(&mut self, now: DateTime<Utc>, window: Duration) {
        self.expires_at = self.expires_at.max(now + window);
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
