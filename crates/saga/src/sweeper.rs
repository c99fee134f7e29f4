use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::{
    FailureKind, RESERVATION_TIMEOUT_REASON, Result, SagaError, SagaOrchestrator, SagaStatus,
    SagaStore,
};

const SWEEP_BATCH: usize = 500;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stored failure decisions whose terminal event was published again.
    pub republished: usize,
    /// Sagas failed for waiting too long on inventory.
    pub timed_out: usize,
    /// Compensation entries given up on.
    pub unconfirmed: usize,
}

/// Enforces saga deadlines.
///
/// Sagas still waiting on inventory past `expires_at` are failed with
/// `reservation_timeout`. Sagas stuck in `compensation_in_progress` past
/// their deadline get their terminal event published again. Failed or
/// cancelled sagas past their compensation deadline have their pending
/// entries marked failed for manual reconciliation.
pub struct SagaTimeoutSweeper {
    orchestrator: Arc<SagaOrchestrator>,
    interval: Duration,
}

impl SagaTimeoutSweeper {
    pub fn new(orchestrator: Arc<SagaOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    fn store(&self) -> &Arc<dyn SagaStore> {
        self.orchestrator.store()
    }

    pub async fn run_once(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        let stuck = self
            .store()
            .expired(&[SagaStatus::CompensationInProgress], now, SWEEP_BATCH)
            .await?;
        for saga in stuck {
            tracing::warn!(
                correlation_id = %saga.correlation_id,
                order_id = ?saga.order_id,
                "terminal event never applied, publishing it again"
            );
            match self.orchestrator.republish_terminal(saga).await {
                Ok(_) => report.republished += 1,
                Err(SagaError::ConcurrencyConflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let stalled = self
            .store()
            .expired(&SagaStatus::AWAITING_RESERVATION, now, SWEEP_BATCH)
            .await?;
        for saga in stalled {
            let Some(order_id) = saga.order_id else {
                continue;
            };
            tracing::warn!(
                correlation_id = %saga.correlation_id,
                %order_id,
                status = %saga.status,
                "saga timed out waiting for inventory"
            );
            match self
                .orchestrator
                .abandon(saga, FailureKind::Failed, RESERVATION_TIMEOUT_REASON)
                .await
            {
                Ok(_) => report.timed_out += 1,
                // A reservation or terminal event got there first.
                Err(SagaError::ConcurrencyConflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        for saga in self.store().overdue_compensations(now, SWEEP_BATCH).await? {
            let Some(order_id) = saga.order_id else {
                continue;
            };
            for entry in self.store().fail_pending_compensations(order_id, now).await? {
                tracing::error!(
                    correlation_id = %saga.correlation_id,
                    %order_id,
                    entry_id = entry.id,
                    action = %entry.compensation_event,
                    payload = %entry.compensation_payload,
                    "compensation never confirmed, needs manual reconciliation"
                );
                metrics::counter!("compensation_unconfirmed_total").increment(1);
                report.unconfirmed += 1;
            }
        }

        Ok(report)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(report) if report != SweepReport::default() => {
                        tracing::info!(
                            republished = report.republished,
                            timed_out = report.timed_out,
                            unconfirmed = report.unconfirmed,
                            "saga sweep finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "saga sweep failed"),
                }
            }
        })
    }
}
