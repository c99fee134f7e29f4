//! Checkout saga state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::SagaError;

/// The status of a checkout saga.
///
/// State transitions:
/// ```text
/// Pending ──► OrderCreated ──► CheckingInventory ──► OrderPlaced ──► OrderConfirmed ──► Completed
///    │              │                  │                  │                │
///    └──────────────┴──────────────────┴──────────────────┴────────────────┴──► CompensationInProgress
///                                                                                  ├──► Failed
///                                                                                  └──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    #[default]
    Pending,
    OrderCreated,
    CheckingInventory,
    OrderPlaced,
    OrderConfirmed,
    /// Walking the compensation log after a failure or cancellation.
    CompensationInProgress,
    Completed,
    Failed,
    Cancelled,
}

impl SagaStatus {
    pub const ALL: [SagaStatus; 9] = [
        SagaStatus::Pending,
        SagaStatus::OrderCreated,
        SagaStatus::CheckingInventory,
        SagaStatus::OrderPlaced,
        SagaStatus::OrderConfirmed,
        SagaStatus::CompensationInProgress,
        SagaStatus::Completed,
        SagaStatus::Failed,
        SagaStatus::Cancelled,
    ];

    /// Statuses in which the saga is still waiting for inventory.
    pub const AWAITING_RESERVATION: [SagaStatus; 3] = [
        SagaStatus::Pending,
        SagaStatus::OrderCreated,
        SagaStatus::CheckingInventory,
    ];

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Failed | SagaStatus::Cancelled
        )
    }

    /// Returns true if the saga can still be failed or cancelled.
    pub fn can_compensate(&self) -> bool {
        !self.is_terminal() && *self != SagaStatus::CompensationInProgress
    }

    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        match (self, next) {
            (Pending, OrderCreated)
            | (OrderCreated, CheckingInventory)
            | (CheckingInventory, OrderPlaced)
            | (OrderPlaced, OrderConfirmed)
            | (OrderConfirmed, Completed)
            | (CompensationInProgress, Failed)
            | (CompensationInProgress, Cancelled) => true,
            (from, CompensationInProgress) => from.can_compensate(),
            _ => false,
        }
    }

    /// Returns the state name as stored and serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "pending",
            SagaStatus::OrderCreated => "order_created",
            SagaStatus::CheckingInventory => "checking_inventory",
            SagaStatus::OrderPlaced => "order_placed",
            SagaStatus::OrderConfirmed => "order_confirmed",
            SagaStatus::CompensationInProgress => "compensation_in_progress",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SagaStatus {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| SagaError::InvalidStatus(s.to_string()))
    }
}
