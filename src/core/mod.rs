//! Core execution logic.
//!
//! This module contains:
//! - Worker: claim/dispatch loop with scheduled retries
//! - Retry: backoff policy for transient failures
//! - Auditor: result bus subscriber writing the ledger
//! - Ledger: append-only JSONL audit record
//! - Safety: limits on content read by handlers

pub mod auditor;
pub mod ledger;
pub mod retry;
pub mod safety;
pub mod worker;

// Re-export commonly used types
pub use auditor::{Auditor, AuditorError};
pub use ledger::{AuditLedger, LedgerError};
pub use retry::RetryPolicy;
pub use safety::{SafetyLimits, SafetyViolation};
pub use worker::{generate_worker_name, Outcome, Routing, Worker, WorkerConfig, WorkerStats};
