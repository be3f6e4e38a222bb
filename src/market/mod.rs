//! The marketplace: the shared queue, result bus and kill switch through
//! which producers, workers and auditors coordinate.
//!
//! Every shared mutation goes through one of three ports:
//! - [`TaskQueue`]: push / claim / requeue / finish
//! - [`ResultBus`]: publish / subscribe
//! - [`KillSwitch`]: engage / is_engaged
//!
//! A [`Marketplace`] bundles one implementation of each and is passed
//! explicitly to every component. Two backends exist: an in-process one
//! ([`memory`]) and a SQLite file shared by several processes ([`sqlite`]).

pub mod memory;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::domain::{Task, TaskId, TaskKind, TaskResult, TaskStatus, TransitionError};

pub use memory::{InMemoryKillSwitch, InMemoryQueue, InMemoryResultBus};
pub use sqlite::SqliteStore;

/// Infrastructure failures. Fatal to the loop that hits them.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Store connection lock poisoned")]
    Poisoned,

    #[error("The {0} result bus cannot replay past results")]
    ReplayUnsupported(&'static str),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Result of pushing a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// New task added to the queue
    Enqueued(TaskId),

    /// A task with this id is already known
    AlreadyExists(TaskId),
}

impl EnqueueResult {
    pub fn id(&self) -> &TaskId {
        match self {
            EnqueueResult::Enqueued(id) | EnqueueResult::AlreadyExists(id) => id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, EnqueueResult::Enqueued(_))
    }
}

/// Task counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub claimed: usize,
    pub done: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.done + self.failed
    }

    pub(crate) fn bump(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Claimed => self.claimed += 1,
            TaskStatus::Done => self.done += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }
}

/// Where a new result subscription starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Only results published after subscribing
    #[default]
    Latest,

    /// Every result ever published (durable buses only)
    Beginning,
}

/// Shared, ordered, blocking task queue partitioned by kind.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append a task. Pushing an id the queue already knows is a no-op.
    async fn push(&self, task: Task) -> Result<EnqueueResult, MarketError>;

    /// Remove and return the oldest ready task whose kind is in `kinds`,
    /// marked CLAIMED. Waits up to `timeout`; `None` when nothing arrived.
    async fn claim(&self, kinds: &[TaskKind], timeout: Duration)
        -> Result<Option<Task>, MarketError>;

    /// Put a PENDING task back at the tail, claimable again after `delay`.
    async fn requeue(&self, task: Task, delay: Duration) -> Result<(), MarketError>;

    /// Record the terminal (DONE/FAILED) state of a claimed task.
    async fn finish(&self, task: &Task) -> Result<(), MarketError>;

    async fn counts(&self) -> Result<QueueCounts, MarketError>;

    /// Delete finished tasks created more than `retention` ago. Returns the number removed.
    async fn purge(&self, retention: chrono::Duration) -> Result<usize, MarketError>;
}

/// Broadcast channel for task results.
#[async_trait]
pub trait ResultBus: Send + Sync {
    /// Publish a result to current subscribers.
    async fn publish(&self, result: &TaskResult) -> Result<(), MarketError>;

    async fn subscribe(&self, from: StartPosition)
        -> Result<Box<dyn ResultSubscription>, MarketError>;
}

/// A live subscription to a [`ResultBus`]
#[async_trait]
pub trait ResultSubscription: Send + Sync {
    /// Next result, waiting as long as needed. `None` once the bus is gone.
    async fn next(&mut self) -> Result<Option<TaskResult>, MarketError>;

    /// Next result only if one is already available; never waits.
    async fn try_next(&mut self) -> Result<Option<TaskResult>, MarketError>;
}

/// One-way stop flag shared by every process.
#[async_trait]
pub trait KillSwitch: Send + Sync {
    /// INACTIVE → ACTIVE. Idempotent.
    async fn engage(&self) -> Result<(), MarketError>;

    async fn is_engaged(&self) -> Result<bool, MarketError>;
}

/// Handles to the shared queue, bus and flag
#[derive(Clone)]
pub struct Marketplace {
    pub queue: Arc<dyn TaskQueue>,
    pub results: Arc<dyn ResultBus>,
    pub kill_switch: Arc<dyn KillSwitch>,
}

impl Marketplace {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        results: Arc<dyn ResultBus>,
        kill_switch: Arc<dyn KillSwitch>,
    ) -> Self {
        Self {
            queue,
            results,
            kill_switch,
        }
    }

    /// Everything in this process; nothing survives it
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryQueue::new()),
            Arc::new(InMemoryResultBus::new()),
            Arc::new(InMemoryKillSwitch::new()),
        )
    }

    /// Backed by a SQLite file that several processes may open at once
    pub fn sqlite(path: &Path) -> Result<Self, MarketError> {
        let store = Arc::new(SqliteStore::open(path)?);
        Ok(Self::new(store.clone(), store.clone(), store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_result_accessors() {
        let new = EnqueueResult::Enqueued(TaskId::from("a"));
        let dup = EnqueueResult::AlreadyExists(TaskId::from("a"));
        assert!(new.is_new());
        assert!(!dup.is_new());
        assert_eq!(new.id(), dup.id());
    }

    #[test]
    fn test_counts_total() {
        let mut counts = QueueCounts::default();
        counts.bump(TaskStatus::Pending);
        counts.bump(TaskStatus::Done);
        counts.bump(TaskStatus::Done);
        assert_eq!(counts.done, 2);
        assert_eq!(counts.total(), 3);
    }
}
