use std::time::Duration;

use tokio::task::JoinHandle;

use crate::InventoryLedger;

const SWEEP_BATCH: usize = 500;

/// Periodically expires reservations whose `expires_at` has passed.
pub struct ReservationSweeper {
    ledger: InventoryLedger,
    interval: Duration,
}

impl ReservationSweeper {
    pub fn new(ledger: InventoryLedger, interval: Duration) -> Self {
        Self { ledger, interval }
    }

    /// Runs a single sweep, draining every due reservation.
    pub async fn run_once(&self) -> usize {
        let mut total = 0;
        loop {
            match self.ledger.expire_due(SWEEP_BATCH).await {
                Ok(0) => return total,
                Ok(n) => total += n,
                Err(e) => {
                    tracing::error!(error = %e, "reservation sweep failed");
                    return total;
                }
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                let expired = self.run_once().await;
                if expired > 0 {
                    tracing::info!(expired, "expired stale reservations");
                }
            }
        })
    }
}
