//! SQLite-backed marketplace shared by several processes.
//!
//! One database file holds the task queue, the result log and the kill
//! switch flag. Every mutation runs inside an IMMEDIATE transaction, so a
//! claim is atomic across processes; contending writers wait on the busy
//! timeout instead of failing. Blocking calls run on tokio's blocking pool.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use super::{
    EnqueueResult, KillSwitch, MarketError, QueueCounts, ResultBus, ResultSubscription,
    StartPosition, TaskQueue,
};
use crate::domain::{Task, TaskKind, TaskResult, TaskStatus, TransitionError};

/// How long a writer waits for another process's lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between store polls while blocked in `claim` or `next`
const POLL_INTERVAL: Duration = Duration::from_millis(50);

const KILL_SWITCH_FLAG: &str = "kill_switch";

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;

    CREATE TABLE IF NOT EXISTS tasks (
      id TEXT PRIMARY KEY,
      kind TEXT NOT NULL,
      status TEXT NOT NULL,
      position INTEGER NOT NULL,
      not_before_ms INTEGER NOT NULL DEFAULT 0,
      created_at_ms INTEGER NOT NULL,
      updated_at_ms INTEGER NOT NULL,
      payload_json TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS results (
      seq INTEGER PRIMARY KEY AUTOINCREMENT,
      job_id TEXT NOT NULL,
      published_at_ms INTEGER NOT NULL,
      payload_json TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS flags (
      name TEXT PRIMARY KEY,
      value INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_ready ON tasks(status, kind, position);
"#;

/// Queue, result bus and kill switch over one SQLite database
pub struct SqliteStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: &Path) -> Result<Self, MarketError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "Opened marketplace store");

        Ok(Self {
            path: path.to_path_buf(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, MarketError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, MarketError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| MarketError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }

    async fn try_claim(&self, kinds: &[TaskKind]) -> Result<Option<Task>, MarketError> {
        if kinds.is_empty() {
            return Ok(None);
        }
        let kinds: Vec<String> = kinds.iter().map(|k| k.as_str().to_string()).collect();

        self.with_conn(move |conn| {
            let now = now_ms();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let placeholders = vec!["?"; kinds.len()].join(", ");
            let sql = format!(
                "SELECT payload_json FROM tasks
                 WHERE status = 'PENDING' AND not_before_ms <= ? AND kind IN ({placeholders})
                 ORDER BY position LIMIT 1"
            );
            let mut values = vec![Value::Integer(now)];
            values.extend(kinds.into_iter().map(Value::Text));

            let payload: Option<String> = tx
                .query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))
                .optional()?;
            let Some(payload) = payload else {
                return Ok(None);
            };

            let mut task: Task = serde_json::from_str(&payload)?;
            task.claim()?;
            tx.execute(
                "UPDATE tasks SET status = ?1, updated_at_ms = ?2, payload_json = ?3 WHERE id = ?4",
                params![
                    task.status.as_str(),
                    now,
                    serde_json::to_string(&task)?,
                    task.id.as_str()
                ],
            )?;
            tx.commit()?;
            Ok(Some(task))
        })
        .await
    }
}

#[async_trait]
impl TaskQueue for SqliteStore {
    async fn push(&self, task: Task) -> Result<EnqueueResult, MarketError> {
        self.with_conn(move |conn| {
            let now = now_ms();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO tasks
                   (id, kind, status, position, not_before_ms, created_at_ms, updated_at_ms, payload_json)
                 VALUES (?1, ?2, ?3, (SELECT COALESCE(MAX(position), 0) + 1 FROM tasks), 0, ?4, ?5, ?6)",
                params![
                    task.id.as_str(),
                    task.kind.as_str(),
                    task.status.as_str(),
                    task.created_at.timestamp_millis(),
                    now,
                    serde_json::to_string(&task)?
                ],
            )?;
            tx.commit()?;

            if inserted == 0 {
                Ok(EnqueueResult::AlreadyExists(task.id))
            } else {
                Ok(EnqueueResult::Enqueued(task.id))
            }
        })
        .await
    }

    async fn claim(
        &self,
        kinds: &[TaskKind],
        timeout: Duration,
    ) -> Result<Option<Task>, MarketError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(task) = self.try_claim(kinds).await? {
                return Ok(Some(task));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
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

        self.with_conn(move |conn| {
            let now = now_ms();
            let not_before = now + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "UPDATE tasks
                 SET status = ?1, not_before_ms = ?2, updated_at_ms = ?3, payload_json = ?4,
                     position = (SELECT COALESCE(MAX(position), 0) + 1 FROM tasks)
                 WHERE id = ?5",
                params![
                    task.status.as_str(),
                    not_before,
                    now,
                    serde_json::to_string(&task)?,
                    task.id.as_str()
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
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

        let task = task.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE tasks SET status = ?1, updated_at_ms = ?2, payload_json = ?3 WHERE id = ?4",
                params![
                    task.status.as_str(),
                    now_ms(),
                    serde_json::to_string(&task)?,
                    task.id.as_str()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn counts(&self) -> Result<QueueCounts, MarketError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut counts = QueueCounts::default();
            for row in rows {
                let (status, n) = row?;
                let n = usize::try_from(n).unwrap_or(0);
                match status.parse::<TaskStatus>() {
                    Ok(TaskStatus::Pending) => counts.pending += n,
                    Ok(TaskStatus::Claimed) => counts.claimed += n,
                    Ok(TaskStatus::Done) => counts.done += n,
                    Ok(TaskStatus::Failed) => counts.failed += n,
                    Err(_) => {}
                }
            }
            Ok(counts)
        })
        .await
    }

    async fn purge(&self, retention: chrono::Duration) -> Result<usize, MarketError> {
        let cutoff = (Utc::now() - retention).timestamp_millis();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM tasks WHERE status IN ('DONE', 'FAILED') AND created_at_ms < ?1",
                params![cutoff],
            )?;
            Ok(removed)
        })
        .await
    }
}

#[async_trait]
impl ResultBus for SqliteStore {
    async fn publish(&self, result: &TaskResult) -> Result<(), MarketError> {
        let job_id = result.job_id.to_string();
        let payload = serde_json::to_string(result)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO results (job_id, published_at_ms, payload_json) VALUES (?1, ?2, ?3)",
                params![job_id, now_ms(), payload],
            )?;
            Ok(())
        })
        .await
    }

    async fn subscribe(
        &self,
        from: StartPosition,
    ) -> Result<Box<dyn ResultSubscription>, MarketError> {
        let cursor = match from {
            StartPosition::Beginning => 0,
            StartPosition::Latest => {
                self.with_conn(|conn| {
                    let seq: i64 =
                        conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM results", [], |row| {
                            row.get(0)
                        })?;
                    Ok(seq)
                })
                .await?
            }
        };

        Ok(Box::new(LogSubscription {
            conn: Arc::clone(&self.conn),
            cursor,
        }))
    }
}

/// Tails the `results` table from a sequence cursor
struct LogSubscription {
    conn: Arc<Mutex<Connection>>,
    cursor: i64,
}

impl LogSubscription {
    async fn fetch_after(&self, cursor: i64) -> Result<Option<(i64, String)>, MarketError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| MarketError::Poisoned)?;
            let row = guard
                .query_row(
                    "SELECT seq, payload_json FROM results WHERE seq > ?1 ORDER BY seq LIMIT 1",
                    params![cursor],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            Ok(row)
        })
        .await?
    }
}

#[async_trait]
impl ResultSubscription for LogSubscription {
    async fn next(&mut self) -> Result<Option<TaskResult>, MarketError> {
        loop {
            if let Some(result) = self.try_next().await? {
                return Ok(Some(result));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn try_next(&mut self) -> Result<Option<TaskResult>, MarketError> {
        match self.fetch_after(self.cursor).await? {
            Some((seq, payload)) => {
                self.cursor = seq;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl KillSwitch for SqliteStore {
    async fn engage(&self) -> Result<(), MarketError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO flags (name, value) VALUES (?1, 1)
                 ON CONFLICT(name) DO UPDATE SET value = 1",
                params![KILL_SWITCH_FLAG],
            )?;
            Ok(())
        })
        .await
    }

    async fn is_engaged(&self) -> Result<bool, MarketError> {
        self.with_conn(|conn| {
            let value: Option<i64> = conn
                .query_row(
                    "SELECT value FROM flags WHERE name = ?1",
                    params![KILL_SWITCH_FLAG],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value == Some(1))
        })
        .await
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
