//! The compensation log: what to undo if the saga fails, newest first.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{CorrelationId, OrderId, ProductId, ReservationId};
use serde::{Deserialize, Serialize};

use crate::{Result, SagaError};

/// A compensating action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationAction {
    /// Give a reservation back to inventory. Inventory performs the release
    /// when it sees the order fail or get cancelled; the entry completes
    /// when the matching `StockReleased` arrives.
    ReleaseReservation,
}

impl CompensationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationAction::ReleaseReservation => "release_reservation",
        }
    }

    /// Remote actions are carried out by another domain and confirmed by an
    /// event; local ones complete while the log is walked.
    pub fn is_remote(&self) -> bool {
        match self {
            CompensationAction::ReleaseReservation => true,
        }
    }
}

impl fmt::Display for CompensationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompensationAction {
    type Err = SagaError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "release_reservation" => Ok(CompensationAction::ReleaseReservation),
            other => Err(SagaError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    Pending,
    Completed,
    /// Never confirmed before the saga's deadline.
    Failed,
}

impl CompensationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationStatus::Pending => "pending",
            CompensationStatus::Completed => "completed",
            CompensationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CompensationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompensationStatus {
    type Err = SagaError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CompensationStatus::Pending),
            "completed" => Ok(CompensationStatus::Completed),
            "failed" => Ok(CompensationStatus::Failed),
            other => Err(SagaError::InvalidStatus(other.to_string())),
        }
    }
}

/// Arguments of a `release_reservation` compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseReservation {
    pub reservation_id: ReservationId,
    pub product_id: ProductId,
    pub quantity: u32,
}

/// One row of the compensation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationEntry {
    /// Store-assigned; increases with insertion order. Zero until stored.
    pub id: i64,
    pub order_id: OrderId,
    pub correlation_id: CorrelationId,
    pub compensation_event: CompensationAction,
    pub compensation_payload: serde_json::Value,
    pub status: CompensationStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CompensationEntry {
    /// A pending `release_reservation` entry.
    pub fn release_reservation(
        order_id: OrderId,
        correlation_id: CorrelationId,
        release: ReleaseReservation,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            id: 0,
            order_id,
            correlation_id,
            compensation_event: CompensationAction::ReleaseReservation,
            compensation_payload: serde_json::to_value(release)?,
            status: CompensationStatus::Pending,
            created_at: now,
            completed_at: None,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.status == CompensationStatus::Pending
    }

    /// The reservation this entry releases, if it is a release.
    pub fn reservation_id(&self) -> Option<ReservationId> {
        match self.compensation_event {
            CompensationAction::ReleaseReservation => {
                serde_json::from_value::<ReleaseReservation>(self.compensation_payload.clone())
                    .ok()
                    .map(|release| release.reservation_id)
            }
        }
    }
}
