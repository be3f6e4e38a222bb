//! Results of executed tasks and the ledger entries recorded for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Success,
    Failed,
}

impl ResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::Success => "SUCCESS",
            ResultStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one task, broadcast on the result bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub job_id: TaskId,
    pub status: ResultStatus,
    pub result_data: Map<String, Value>,

    /// Name of the worker that produced this result
    pub completed_by: String,
}

impl TaskResult {
    pub fn success(job_id: TaskId, result_data: Map<String, Value>, completed_by: &str) -> Self {
        Self {
            job_id,
            status: ResultStatus::Success,
            result_data,
            completed_by: completed_by.to_string(),
        }
    }

    /// A failed result; the error and attempt count go into `result_data`
    pub fn failed(job_id: TaskId, error: &str, attempts: u32, completed_by: &str) -> Self {
        let mut result_data = Map::new();
        result_data.insert("error".to_string(), Value::String(error.to_string()));
        result_data.insert("attempts".to_string(), Value::from(attempts));
        Self {
            job_id,
            status: ResultStatus::Failed,
            result_data,
            completed_by: completed_by.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// One line of the audit ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub timestamp: DateTime<Utc>,
    pub job_id: TaskId,

    /// Short description of what was audited
    pub subject: String,

    pub result: ResultStatus,
    pub signed_by: String,
    pub rationale: String,
}

impl LedgerEntry {
    /// Build the entry an auditor records for an observed result.
    ///
    /// The rationale is the result's `result_data`, serialised as JSON.
    pub fn for_result(result: &TaskResult, signed_by: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            job_id: result.job_id.clone(),
            subject: format!("Task completion by {}", result.completed_by),
            result: result.status,
            signed_by: signed_by.to_string(),
            rationale: Value::Object(result.result_data.clone()).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_wire_format() {
        let mut data = Map::new();
        data.insert("status".to_string(), Value::from("connected"));
        let result = TaskResult::success(TaskId::from("abc"), data, "worker-1");

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["job_id"], "abc");
        assert_eq!(value["status"], "SUCCESS");
        assert_eq!(value["result_data"]["status"], "connected");
        assert_eq!(value["completed_by"], "worker-1");
    }

    #[test]
    fn test_failed_result_carries_error() {
        let result = TaskResult::failed(TaskId::from("abc"), "platform down", 3, "worker-2");
        assert!(!result.is_success());
        assert_eq!(result.result_data["attempts"], 3);

        let entry = LedgerEntry::for_result(&result, "AuditorAgent");
        assert_eq!(entry.job_id, result.job_id);
        assert_eq!(entry.result, ResultStatus::Failed);
        assert!(entry.rationale.contains("platform down"));
        assert_eq!(entry.signed_by, "AuditorAgent");
    }
}
