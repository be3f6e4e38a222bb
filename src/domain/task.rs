//! Tasks: validated commands travelling through the queue.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::command::{Command, TaskKind, TaskParams, ValidationError};

/// Content-hash identifier of a task (SHA256 of the raw line, 12 hex chars)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Derive the id from a raw command line
    pub fn from_raw(raw: &str) -> Self {
        let digest = Sha256::digest(raw.as_bytes());
        Self(hex::encode(&digest[..6]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Pending,
    Claimed,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Claimed => "CLAIMED",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "CLAIMED" => Ok(TaskStatus::Claimed),
            "DONE" => Ok(TaskStatus::Done),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid task transition for {id}: {from} → {to}")]
pub struct TransitionError {
    pub id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// A unit of work on the queue.
///
/// Serialises to the wire record `{id, type, params, raw, ts}` plus the
/// bookkeeping fields `status` and `attempts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    #[serde(rename = "type")]
    pub kind: TaskKind,

    pub params: BTreeMap<String, String>,

    /// The command line this task was parsed from
    pub raw: String,

    #[serde(rename = "ts")]
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub status: TaskStatus,

    /// Handler invocations already made
    #[serde(default)]
    pub attempts: u32,

    /// Error from the most recent failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Task {
    pub fn from_command(command: &Command) -> Self {
        Self {
            id: TaskId::from_raw(command.raw()),
            kind: command.kind(),
            params: command.params().clone(),
            raw: command.raw().to_string(),
            created_at: Utc::now(),
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    /// Decode `params` into the typed struct for this task's kind
    pub fn typed_params(&self) -> Result<TaskParams, ValidationError> {
        TaskParams::build(self.kind, &self.params)
    }

    /// Number of the attempt the next handler invocation will be
    pub fn next_attempt(&self) -> u32 {
        self.attempts + 1
    }

    /// PENDING → CLAIMED
    pub fn claim(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Pending, TaskStatus::Claimed)
    }

    /// CLAIMED → DONE after the given attempt succeeded
    pub fn complete(&mut self, attempt: u32) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Claimed, TaskStatus::Done)?;
        self.attempts = attempt;
        Ok(())
    }

    /// CLAIMED → FAILED after the given attempt
    pub fn fail(&mut self, attempt: u32, error: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Claimed, TaskStatus::Failed)?;
        self.attempts = attempt;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// CLAIMED → PENDING with the attempt counter advanced
    pub fn schedule_retry(
        &mut self,
        attempt: u32,
        error: impl Into<String>,
    ) -> Result<(), TransitionError> {
        if attempt <= self.attempts {
            return Err(self.invalid(TaskStatus::Pending));
        }
        self.transition(TaskStatus::Claimed, TaskStatus::Pending)?;
        self.attempts = attempt;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// CLAIMED → PENDING, unchanged otherwise (handed back for another worker)
    pub fn release(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Claimed, TaskStatus::Pending)
    }

    fn transition(&mut self, from: TaskStatus, to: TaskStatus) -> Result<(), TransitionError> {
        if self.status != from {
            return Err(self.invalid(to));
        }
        self.status = to;
        Ok(())
    }

    fn invalid(&self, to: TaskStatus) -> TransitionError {
        TransitionError {
            id: self.id.clone(),
            from: self.status,
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(raw: &str) -> Task {
        let mut params = BTreeMap::new();
        params.insert("domain".to_string(), "example.com".to_string());
        Task::from_command(&Command::new(TaskKind::ScanSite, params, raw))
    }

    #[test]
    fn test_id_is_content_hash() {
        let a = TaskId::from_raw("SCAN_SITE domain=example.com");
        let b = TaskId::from_raw("SCAN_SITE domain=example.com");
        let c = TaskId::from_raw("SCAN_SITE domain=example.org");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 12);
        assert!(a.as_str().chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_wire_record_fields() {
        let t = task("SCAN_SITE domain=example.com");
        let value = serde_json::to_value(&t).unwrap();

        assert_eq!(value["type"], "SCAN_SITE");
        assert_eq!(value["params"]["domain"], "example.com");
        assert_eq!(value["raw"], "SCAN_SITE domain=example.com");
        assert!(value["ts"].is_string());
        assert_eq!(value["id"], t.id.as_str());
        assert!(value.get("last_error").is_none());
    }

    #[test]
    fn test_minimal_wire_record_deserializes() {
        let json = r#"{"id":"abc123abc123","type":"SCAN_SITE","params":{"domain":"x.io"},
            "raw":"SCAN_SITE domain=x.io","ts":"2024-01-01T00:00:00Z"}"#;
        let t: Task = serde_json::from_str(json).unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.attempts, 0);
        assert_eq!(t.kind, TaskKind::ScanSite);
    }

    #[test]
    fn test_lifecycle_never_regresses() {
        let mut t = task("SCAN_SITE domain=example.com");
        t.claim().unwrap();
        assert!(t.claim().is_err());

        t.schedule_retry(1, "timeout").unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.attempts, 1);

        t.claim().unwrap();
        assert!(t.schedule_retry(1, "again").is_err());
        t.complete(2).unwrap();
        assert_eq!(t.status, TaskStatus::Done);

        assert!(t.release().is_err());
        assert!(t.fail(3, "late").is_err());
    }
}
