//! In-process marketplace backend.
//!
//! The queue keeps one FIFO per task kind plus a global push sequence, so a
//! claimer allowed every kind still sees strict push order. Tasks requeued
//! with a delay wait in a min-heap until they are due.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Instant;
use tracing::warn;

use super::{
    EnqueueResult, KillSwitch, MarketError, QueueCounts, ResultBus, ResultSubscription,
    StartPosition, TaskQueue,
};
use crate::domain::{Task, TaskId, TaskKind, TaskResult, TaskStatus, TransitionError};

/// Broadcast buffer per subscriber before it starts lagging
const BUS_CAPACITY: usize = 1024;

/// Entry of the retry heap. Reversed ordering makes `BinaryHeap` a min-heap.
#[derive(Debug, PartialEq, Eq)]
struct Scheduled {
    ready_at: Instant,
    order: u64,
    task_id: TaskId,
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.ready_at, other.order).cmp(&(self.ready_at, self.order))
    }
}

#[derive(Default)]
struct QueueState {
    /// Next global sequence number
    next_seq: u64,

    /// Ready task ids per kind, each tagged with its push sequence
    topics: HashMap<TaskKind, VecDeque<(u64, TaskId)>>,

    /// Every known task, keyed by id
    records: HashMap<TaskId, Task>,

    /// Tasks waiting out a retry delay
    scheduled: BinaryHeap<Scheduled>,
}

impl QueueState {
    fn make_ready(&mut self, id: TaskId, kind: TaskKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.topics.entry(kind).or_default().push_back((seq, id));
    }

    fn promote_due(&mut self, now: Instant) {
        while self.scheduled.peek().is_some_and(|s| s.ready_at <= now) {
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            let kind = match self.records.get(&entry.task_id) {
                Some(task) if task.status == TaskStatus::Pending => task.kind,
                _ => continue,
            };
            self.make_ready(entry.task_id, kind);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.scheduled.peek().map(|s| s.ready_at)
    }

    /// Pop the ready task with the lowest sequence among `kinds`
    fn pop_oldest(&mut self, kinds: &[TaskKind]) -> Result<Option<Task>, TransitionError> {
        let oldest = kinds
            .iter()
            .filter_map(|kind| {
                self.topics
                    .get(kind)
                    .and_then(|q| q.front())
                    .map(|(seq, _)| (*seq, *kind))
            })
            .min_by_key(|(seq, _)| *seq);

        let Some((_, kind)) = oldest else {
            return Ok(None);
        };
        let Some((_, id)) = self.topics.get_mut(&kind).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };

        match self.records.get_mut(&id) {
            Some(task) => {
                task.claim()?;
                Ok(Some(task.clone()))
            }
            None => Ok(None),
        }
    }
}

/// In-memory [`TaskQueue`]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn push(&self, task: Task) -> Result<EnqueueResult, MarketError> {
        let id = task.id.clone();
        {
            let mut state = self.state.lock().await;
            if state.records.contains_key(&id) {
                return Ok(EnqueueResult::AlreadyExists(id));
            }
            let kind = task.kind;
            state.records.insert(id.clone(), task);
            state.make_ready(id.clone(), kind);
        }
        self.notify.notify_waiters();
        Ok(EnqueueResult::Enqueued(id))
    }

    async fn claim(
        &self,
        kinds: &[TaskKind],
        timeout: Duration,
    ) -> Result<Option<Task>, MarketError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Registered before inspecting state so a push in between is not missed.
            let notified = self.notify.notified();

            let next_due = {
                let mut state = self.state.lock().await;
                state.promote_due(Instant::now());
                if let Some(task) = state.pop_oldest(kinds)? {
                    return Ok(Some(task));
                }
                state.next_due()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake_at = next_due.map_or(deadline, |due| due.min(deadline));

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn requeue(&self, task: Task, delay: Duration) -> Result<(), MarketError> {
        if task.status != TaskStatus::Pending {
            return Err(TransitionError {
                id: task.id.clone(),
                from: task.status,
                to: TaskStatus::Pending,
            }
            .into());
        }

        {
            let mut state = self.state.lock().await;
            let id = task.id.clone();
            let kind = task.kind;
            state.records.insert(id.clone(), task);

            if delay.is_zero() {
                state.make_ready(id, kind);
            } else {
                let order = state.next_seq;
                state.next_seq += 1;
                state.scheduled.push(Scheduled {
                    ready_at: Instant::now() + delay,
                    order,
                    task_id: id,
                });
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn finish(&self, task: &Task) -> Result<(), MarketError> {
        if !task.status.is_terminal() {
            return Err(TransitionError {
                id: task.id.clone(),
                from: TaskStatus::Claimed,
                to: task.status,
            }
            .into());
        }
        let mut state = self.state.lock().await;
        state.records.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn counts(&self) -> Result<QueueCounts, MarketError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for task in state.records.values() {
            counts.bump(task.status);
        }
        Ok(counts)
    }

    async fn purge(&self, retention: chrono::Duration) -> Result<usize, MarketError> {
        let cutoff = chrono::Utc::now() - retention;
        let mut state = self.state.lock().await;
        let before = state.records.len();
        state
            .records
            .retain(|_, task| !(task.status.is_terminal() && task.created_at < cutoff));
        Ok(before - state.records.len())
    }
}

/// Ephemeral [`ResultBus`]: results reach only subscribers listening at publish time
pub struct InMemoryResultBus {
    sender: broadcast::Sender<TaskResult>,
}

impl InMemoryResultBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }
}

impl Default for InMemoryResultBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultBus for InMemoryResultBus {
    async fn publish(&self, result: &TaskResult) -> Result<(), MarketError> {
        // No receivers is fine: delivery is at-most-once to live listeners.
        let _ = self.sender.send(result.clone());
        Ok(())
    }

    async fn subscribe(
        &self,
        from: StartPosition,
    ) -> Result<Box<dyn ResultSubscription>, MarketError> {
        if from == StartPosition::Beginning {
            return Err(MarketError::ReplayUnsupported("in-memory"));
        }
        Ok(Box::new(BroadcastSubscription {
            receiver: self.sender.subscribe(),
        }))
    }
}

struct BroadcastSubscription {
    receiver: broadcast::Receiver<TaskResult>,
}

#[async_trait]
impl ResultSubscription for BroadcastSubscription {
    async fn next(&mut self) -> Result<Option<TaskResult>, MarketError> {
        loop {
            match self.receiver.recv().await {
                Ok(result) => return Ok(Some(result)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Result subscriber lagged, results dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn try_next(&mut self) -> Result<Option<TaskResult>, MarketError> {
        loop {
            match self.receiver.try_recv() {
                Ok(result) => return Ok(Some(result)),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Result subscriber lagged, results dropped");
                }
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return Ok(None),
            }
        }
    }
}

/// Process-local [`KillSwitch`]
#[derive(Default)]
pub struct InMemoryKillSwitch {
    engaged: AtomicBool,
}

impl InMemoryKillSwitch {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KillSwitch for InMemoryKillSwitch {
    async fn engage(&self) -> Result<(), MarketError> {
        self.engaged.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_engaged(&self) -> Result<bool, MarketError> {
        Ok(self.engaged.load(Ordering::SeqCst))
    }
}
