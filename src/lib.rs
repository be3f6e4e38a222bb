//! agentkit - Command-to-task marketplace for agents
//!
//! Plain-text commands are polled from a source, validated against a
//! per-kind schema, deduplicated and pushed onto a task queue. Workers
//! claim tasks by kind, execute them and publish results; an auditor
//! records every result in an append-only ledger.
//!
//! # Architecture
//!
//! ```text
//! CommandSource -> CommandValidator -> Deduplicator -> TaskQueue
//!     -> Worker -> ResultBus -> Auditor -> AuditLedger
//! ```
//!
//! A `KILL_SWITCH` command engages a shared flag that stops production
//! and makes workers exit before their next claim.
//!
//! # Modules
//!
//! - `domain`: Data structures (Command, Task, TaskResult, LedgerEntry)
//! - `ingest`: Command sources, validation, dedup and the poll loop
//! - `market`: Queue, result bus and kill switch (memory and SQLite)
//! - `handlers`: Task handlers keyed by kind
//! - `core`: Worker, Auditor, AuditLedger, retry and safety limits
//! - `config`: Layered configuration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Everything in one process
//! agentkit run --workers 3
//!
//! # Or one process per role over the SQLite store
//! agentkit produce
//! agentkit work --kinds SCAN_SITE,PUBLISH_REPORT
//! agentkit audit
//!
//! # Add a command and stop everything
//! agentkit submit SCAN_SITE domain=example.com
//! agentkit kill
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod handlers;
pub mod ingest;
pub mod market;

// Re-export main types at crate root for convenience
pub use core::{AuditLedger, Auditor, RetryPolicy, Routing, Worker, WorkerConfig};
pub use domain::{Command, LedgerEntry, Task, TaskId, TaskKind, TaskResult, TaskStatus};
pub use handlers::{Handler, HandlerError, HandlerSet};
pub use ingest::{CommandSource, CommandValidator, FileSource, Producer};
pub use market::{Marketplace, StartPosition};
