//! Append-only JSONL audit ledger.
//!
//! One [`LedgerEntry`] per line. Appends hold an exclusive file lock for
//! the duration of the write, so several auditors (threads or processes)
//! sharing a ledger never interleave records. Existing lines are never
//! rewritten.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::domain::LedgerEntry;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("IO error on ledger {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to acquire lock on ledger {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Ledger write task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// JSONL ledger file
#[derive(Debug, Clone)]
pub struct AuditLedger {
    path: PathBuf,
}

impl AuditLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry under an exclusive lock
    pub async fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let line = serde_json::to_string(entry)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || append_line(&path, &line)).await?
    }

    /// Every entry, in append order. A missing ledger is empty.
    pub async fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let io_err = |source| LedgerError::Io {
            path: self.path.clone(),
            source,
        };

        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(e)),
        };

        let mut lines = BufReader::new(file).lines();
        let mut entries = Vec::new();
        while let Some(line) = lines.next_line().await.map_err(io_err)? {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

fn append_line(path: &Path, line: &str) -> Result<(), LedgerError> {
    let io_err = |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;

    file.lock_exclusive().map_err(|source| LedgerError::Lock {
        path: path.to_path_buf(),
        source,
    })?;

    // Lock is released when the file is dropped.
    writeln!(file, "{}", line).map_err(io_err)?;
    file.flush().map_err(io_err)?;
    Ok(())
}
