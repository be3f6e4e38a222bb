//! Worker dispatch loop.
//!
//! A worker claims one task at a time, runs the handler registered for its
//! kind and reports the outcome on the result bus. Transient failures are
//! not slept on: the task goes back to the queue with its attempt counter
//! advanced and becomes claimable once the backoff delay has passed, so the
//! worker is free to pick up other work meanwhile.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::retry::RetryPolicy;
use crate::domain::{Task, TaskKind, TaskResult};
use crate::handlers::{HandlerError, HandlerSet};
use crate::market::{MarketError, Marketplace};

/// Which tasks a worker claims
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Routing {
    /// Only kinds the worker has handlers for
    #[default]
    Topic,
    /// Any kind; tasks without a handler are put back for another worker
    Shared,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Reported as `completed_by`
    pub name: String,
    /// Longest a single claim blocks before the loop re-checks for shutdown
    pub claim_timeout: Duration,
    pub retry: RetryPolicy,
    pub routing: Routing,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: generate_worker_name(),
            claim_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            routing: Routing::Topic,
        }
    }
}

/// A fresh `worker-xxxxxxxx` name
pub fn generate_worker_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}

/// What happened to one claimed task
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// DONE or FAILED; the result was published
    Completed(TaskResult),
    /// Attempt failed transiently; the task is back on the queue
    RetryScheduled { attempt: u32, delay: Duration },
    /// No handler here; the task is back on the queue unchanged
    Requeued,
}

/// Counters for one worker's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub succeeded: u64,
    pub failed: u64,
    pub retries: u64,
    pub requeued: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Completed(result) if result.is_success() => self.succeeded += 1,
            Outcome::Completed(_) => self.failed += 1,
            Outcome::RetryScheduled { .. } => self.retries += 1,
            Outcome::Requeued => self.requeued += 1,
        }
    }
}

pub struct Worker {
    market: Marketplace,
    handlers: HandlerSet,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(market: Marketplace, handlers: HandlerSet, config: WorkerConfig) -> Self {
        Self {
            market,
            handlers,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Kinds passed to `claim`
    pub fn claim_kinds(&self) -> Vec<TaskKind> {
        match self.config.routing {
            Routing::Topic => self.handlers.kinds(),
            Routing::Shared => TaskKind::queued().collect(),
        }
    }

    /// Claim and process tasks until shutdown or the kill switch is engaged.
    ///
    /// Only infrastructure errors end the loop early.
    #[instrument(skip(self, shutdown), fields(worker = %self.config.name))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<WorkerStats, MarketError> {
        let kinds = self.claim_kinds();
        info!(kinds = ?kinds, routing = ?self.config.routing, "Worker online");

        let mut stats = WorkerStats::default();
        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested, worker stopping");
                break;
            }
            if self.market.kill_switch.is_engaged().await? {
                info!("Kill switch engaged, worker stopping");
                break;
            }

            let Some(task) = self
                .market
                .queue
                .claim(&kinds, self.config.claim_timeout)
                .await?
            else {
                debug!("No task available");
                continue;
            };

            let outcome = self.process(task).await?;
            stats.record(&outcome);
        }

        info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            retries = stats.retries,
            "Worker stopped"
        );
        Ok(stats)
    }

    /// Claim at most one task (waiting up to `timeout`) and process it
    pub async fn run_once(&self, timeout: Duration) -> Result<Option<Outcome>, MarketError> {
        let kinds = self.claim_kinds();
        match self.market.queue.claim(&kinds, timeout).await? {
            Some(task) => Ok(Some(self.process(task).await?)),
            None => Ok(None),
        }
    }

    /// Execute one claimed task and settle it
    #[instrument(skip(self, task), fields(task_id = %task.id, kind = %task.kind))]
    pub async fn process(&self, mut task: Task) -> Result<Outcome, MarketError> {
        let Some(handler) = self.handlers.get(task.kind) else {
            warn!("No handler for this kind, returning task to the queue");
            task.release()?;
            self.market.queue.requeue(task, Duration::ZERO).await?;
            return Ok(Outcome::Requeued);
        };

        let attempt = task.next_attempt();
        let executed = match task.typed_params() {
            Ok(params) => handler.execute(&params).await,
            Err(e) => Err(HandlerError::from(e)),
        };

        match executed {
            Ok(data) => {
                task.complete(attempt)?;
                self.market.queue.finish(&task).await?;
                info!(attempt, "Task completed");
                let result = TaskResult::success(task.id.clone(), data, &self.config.name);
                self.market.results.publish(&result).await?;
                Ok(Outcome::Completed(result))
            }
            Err(e) if e.is_transient() && self.config.retry.should_retry(attempt) => {
                let delay = self.config.retry.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retry scheduled"
                );
                task.schedule_retry(attempt, e.to_string())?;
                self.market.queue.requeue(task, delay).await?;
                Ok(Outcome::RetryScheduled { attempt, delay })
            }
            Err(e) => {
                error!(attempt, error = %e, "Task failed");
                let message = e.to_string();
                task.fail(attempt, message.clone())?;
                self.market.queue.finish(&task).await?;
                let result =
                    TaskResult::failed(task.id.clone(), &message, attempt, &self.config.name);
                self.market.results.publish(&result).await?;
                Ok(Outcome::Completed(result))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::domain::{Command, ResultStatus, TaskStatus};
    use crate::handlers::{ContentDistributor, SiteScanHandler};
    use crate::market::StartPosition;

    fn task(kind: TaskKind, params: &[(&str, &str)], raw: &str) -> Task {
        let params: BTreeMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Task::from_command(&Command::new(kind, params, raw))
    }

    fn config(routing: Routing) -> WorkerConfig {
        WorkerConfig {
            name: "worker-test".to_string(),
            claim_timeout: Duration::ZERO,
            retry: RetryPolicy::immediate(3),
            routing,
        }
    }

    #[test]
    fn test_generated_names_are_distinct() {
        let a = generate_worker_name();
        let b = generate_worker_name();
        assert!(a.starts_with("worker-"));
        assert_eq!(a.len(), "worker-".len() + 8);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_success_publishes_result() {
        let market = Marketplace::in_memory();
        let mut sub = market.results.subscribe(StartPosition::Latest).await.unwrap();
        let mut handlers = HandlerSet::new();
        handlers.register(SiteScanHandler).unwrap();
        let worker = Worker::new(market.clone(), handlers, config(Routing::Topic));

        let t = task(TaskKind::ScanSite, &[("domain", "example.com")], "scan");
        let id = t.id.clone();
        market.queue.push(t).await.unwrap();

        let outcome = worker.run_once(Duration::ZERO).await.unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Completed(ref r) if r.is_success()));

        let published = sub.next().await.unwrap().unwrap();
        assert_eq!(published.job_id, id);
        assert_eq!(published.completed_by, "worker-test");
        assert_eq!(market.queue.counts().await.unwrap().done, 1);
    }

    #[tokio::test]
    async fn test_fatal_failure_is_not_retried() {
        let market = Marketplace::in_memory();
        let handlers = HandlerSet::builtin(ContentDistributor::default()).unwrap();
        let worker = Worker::new(market.clone(), handlers, config(Routing::Topic));

        // The integration-status handler needs a `service` parameter.
        market
            .queue
            .push(task(TaskKind::CheckIntegrationStatus, &[], "status"))
            .await
            .unwrap();

        let outcome = worker.run_once(Duration::ZERO).await.unwrap().unwrap();
        match outcome {
            Outcome::Completed(result) => {
                assert_eq!(result.status, ResultStatus::Failed);
                assert_eq!(result.result_data["attempts"], 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(market.queue.counts().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_topic_worker_ignores_foreign_kinds() {
        let market = Marketplace::in_memory();
        let mut handlers = HandlerSet::new();
        handlers.register(SiteScanHandler).unwrap();
        let worker = Worker::new(market.clone(), handlers, config(Routing::Topic));

        market
            .queue
            .push(task(TaskKind::RefreshToken, &[("service", "x")], "refresh"))
            .await
            .unwrap();

        assert_eq!(worker.claim_kinds(), vec![TaskKind::ScanSite]);
        assert!(worker.run_once(Duration::ZERO).await.unwrap().is_none());
        assert_eq!(market.queue.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_shared_worker_requeues_unhandled_kind() {
        let market = Marketplace::in_memory();
        let mut handlers = HandlerSet::new();
        handlers.register(SiteScanHandler).unwrap();
        let worker = Worker::new(market.clone(), handlers, config(Routing::Shared));

        market
            .queue
            .push(task(TaskKind::RefreshToken, &[("service", "x")], "refresh"))
            .await
            .unwrap();

        let outcome = worker.run_once(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(outcome, Outcome::Requeued);

        let counts = market.queue.counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        let back = market
            .queue
            .claim(&[TaskKind::RefreshToken], Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back.attempts, 0);
        assert_eq!(back.status, TaskStatus::Claimed);
    }

    #[tokio::test]
    async fn test_run_exits_when_kill_switch_engaged() {
        let market = Marketplace::in_memory();
        market.kill_switch.engage().await.unwrap();
        let worker = Worker::new(market, HandlerSet::new(), config(Routing::Topic));

        let (_tx, rx) = watch::channel(false);
        let stats = worker.run(rx).await.unwrap();
        assert_eq!(stats, WorkerStats::default());
    }
}
