//! Poll loop turning command lines into queued tasks.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::dedup::Deduplicator;
use super::source::{CommandSource, SourceError};
use super::validator::CommandValidator;
use crate::domain::{CommandError, Task, TaskKind};
use crate::market::{EnqueueResult, MarketError, Marketplace};

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Market(#[from] MarketError),
}

/// What one poll cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Lines read from the source
    pub read: usize,
    /// New tasks pushed to the queue
    pub enqueued: usize,
    /// Lines skipped because they were already seen
    pub duplicates: usize,
    /// Lines the queue already held a task for
    pub already_queued: usize,
    /// Unknown or invalid lines dropped
    pub rejected: usize,
    /// The kill switch was active (or engaged during this cycle)
    pub halted: bool,
}

/// Reads a [`CommandSource`] and feeds the marketplace queue
pub struct Producer {
    source: Arc<dyn CommandSource>,
    validator: CommandValidator,
    dedup: Deduplicator,
    market: Marketplace,
    interval: Duration,
}

impl Producer {
    pub fn new(source: Arc<dyn CommandSource>, market: Marketplace, interval: Duration) -> Self {
        Self {
            source,
            validator: CommandValidator::new(),
            dedup: Deduplicator::new(),
            market,
            interval,
        }
    }

    /// Number of distinct lines accepted so far
    pub fn seen(&self) -> usize {
        self.dedup.len()
    }

    /// Run one poll cycle
    pub async fn poll_once(&mut self) -> Result<PollReport, ProducerError> {
        let mut report = PollReport::default();
        if self.market.kill_switch.is_engaged().await? {
            report.halted = true;
            return Ok(report);
        }

        let lines = self.source.read_lines().await?;
        report.read = lines.len();

        for line in lines {
            if self.dedup.is_seen(&line) {
                report.duplicates += 1;
                continue;
            }

            let command = match self.validator.parse(&line) {
                Ok(command) => command,
                Err(CommandError::UnknownCommand(keyword)) => {
                    warn!(line = %line, keyword = %keyword, "Dropping unknown command");
                    report.rejected += 1;
                    continue;
                }
                Err(e) => {
                    warn!(line = %line, error = %e, "Dropping invalid command");
                    report.rejected += 1;
                    continue;
                }
            };

            if command.kind() == TaskKind::KillSwitch {
                self.market.kill_switch.engage().await?;
                self.dedup.mark_seen(&line);
                warn!("Kill switch engaged, halting production");
                report.halted = true;
                break;
            }

            let task = Task::from_command(&command);
            match self.market.queue.push(task).await? {
                EnqueueResult::Enqueued(id) => {
                    info!(task_id = %id, kind = %command.kind(), "Task enqueued");
                    report.enqueued += 1;
                }
                EnqueueResult::AlreadyExists(id) => {
                    debug!(task_id = %id, "Task already queued");
                    report.already_queued += 1;
                }
            }
            self.dedup.mark_seen(&line);
        }

        Ok(report)
    }

    /// Poll until shutdown or until the kill switch is engaged
    #[instrument(skip(self, shutdown), fields(source = %self.source.describe()))]
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ProducerError> {
        info!(interval_secs = self.interval.as_secs(), "Command poller started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let report = self.poll_once().await?;
            if report.enqueued > 0 || report.rejected > 0 {
                info!(
                    enqueued = report.enqueued,
                    rejected = report.rejected,
                    "Poll cycle complete"
                );
            }
            if report.halted {
                info!("Kill switch active, command poller stopped");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
