//! Auditor: records every observed result in the ledger.

use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, instrument};

use super::ledger::{AuditLedger, LedgerError};
use crate::domain::{LedgerEntry, TaskResult};
use crate::market::{MarketError, Marketplace, ResultSubscription, StartPosition};

#[derive(Debug, Error)]
pub enum AuditorError {
    #[error(transparent)]
    Market(#[from] MarketError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// A subscriber on the result bus that appends to an [`AuditLedger`].
///
/// The subscription is taken in [`Auditor::attach`], so results published
/// after `attach` returns are recorded even if `run` starts later.
pub struct Auditor {
    subscription: Box<dyn ResultSubscription>,
    ledger: AuditLedger,
    signed_by: String,
}

impl Auditor {
    pub async fn attach(
        market: &Marketplace,
        ledger: AuditLedger,
        signed_by: impl Into<String>,
        from: StartPosition,
    ) -> Result<Self, AuditorError> {
        let subscription = market.results.subscribe(from).await?;
        Ok(Self {
            subscription,
            ledger,
            signed_by: signed_by.into(),
        })
    }

    pub fn ledger(&self) -> &AuditLedger {
        &self.ledger
    }

    /// Record the next result. `None` once the bus has closed.
    pub async fn record_next(&mut self) -> Result<Option<LedgerEntry>, AuditorError> {
        match self.subscription.next().await? {
            Some(result) => Ok(Some(self.record(&result).await?)),
            None => Ok(None),
        }
    }

    /// Record every result already delivered to this subscriber, without
    /// waiting for new ones. Returns the number recorded.
    pub async fn drain(&mut self) -> Result<u64, AuditorError> {
        let mut recorded = 0;
        while let Some(result) = self.subscription.try_next().await? {
            self.record(&result).await?;
            recorded += 1;
        }
        Ok(recorded)
    }

    async fn record(&self, result: &TaskResult) -> Result<LedgerEntry, AuditorError> {
        let entry = LedgerEntry::for_result(result, &self.signed_by);
        self.ledger.append(&entry).await?;
        info!(
            job_id = %result.job_id,
            status = %result.status,
            completed_by = %result.completed_by,
            "Recorded result"
        );
        Ok(entry)
    }

    /// Record results until shutdown or until the bus closes. On shutdown,
    /// results already delivered are still written before returning.
    /// Returns the number of entries written.
    #[instrument(skip(self, shutdown), fields(ledger = %self.ledger.path().display()))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<u64, AuditorError> {
        info!(signed_by = %self.signed_by, "Auditor listening for results");
        let mut recorded = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            // Only the receive is raced against shutdown; a received result is always written.
            let next = tokio::select! {
                biased;
                next = self.subscription.next() => next?,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };
            match next {
                Some(result) => {
                    self.record(&result).await?;
                    recorded += 1;
                }
                None => break,
            }
        }
        recorded += self.drain().await?;
        info!(recorded, "Auditor stopped");
        Ok(recorded)
    }
}
