//! Domain types for the agentkit marketplace.
//!
//! - Command: a validated command line and its typed parameters
//! - Task: queued unit of work derived from one command
//! - Result: task outcomes and the ledger entries recorded for them

pub mod command;
pub mod result;
pub mod task;

// Re-export commonly used types
pub use command::{
    Command, CommandError, DistributeContent, OpenParams, PublishReport, ReportFormat, ScanSite,
    TaskKind, TaskParams, UpdateNotion, ValidationError,
};
pub use result::{LedgerEntry, ResultStatus, TaskResult};
pub use task::{Task, TaskId, TaskStatus, TransitionError};
