//! Line-oriented command feeds.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Header written to a command file that did not exist yet
pub const COMMAND_FILE_HEADER: &str = "# Add commands below\n";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to read command source {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create command source {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A document of command lines, re-read on every poll
#[async_trait]
pub trait CommandSource: Send + Sync {
    /// Current command lines, trimmed, without blanks or `#` comments
    async fn read_lines(&self) -> Result<Vec<String>, SourceError>;

    /// Human-readable name for logs
    fn describe(&self) -> String;
}

fn command_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Commands kept in a plain text file
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file with its header if it is missing
    pub async fn ensure_exists(&self) -> Result<(), SourceError> {
        let exists = tokio::fs::try_exists(&self.path)
            .await
            .map_err(|source| SourceError::Read {
                path: self.path.clone(),
                source,
            })?;
        if exists {
            return Ok(());
        }
        let create_err = |source| SourceError::Create {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(create_err)?;
        }
        tokio::fs::write(&self.path, COMMAND_FILE_HEADER)
            .await
            .map_err(create_err)?;
        info!(path = %self.path.display(), "Created command file");
        Ok(())
    }
}

#[async_trait]
impl CommandSource for FileSource {
    async fn read_lines(&self) -> Result<Vec<String>, SourceError> {
        self.ensure_exists().await?;
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::Read {
                path: self.path.clone(),
                source,
            })?;
        Ok(command_lines(&text))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory document, appended to by the caller
#[derive(Debug, Default)]
pub struct MemorySource {
    text: Mutex<String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_line(&self, line: &str) {
        let mut text = self.text.lock().await;
        text.push_str(line);
        text.push('\n');
    }
}

#[async_trait]
impl CommandSource for MemorySource {
    async fn read_lines(&self) -> Result<Vec<String>, SourceError> {
        Ok(command_lines(&self.text.lock().await))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_created_with_header() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("inbox").join("commands.txt");
        let source = FileSource::new(&path);

        assert!(source.read_lines().await.unwrap().is_empty());
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, COMMAND_FILE_HEADER);
    }

    #[tokio::test]
    async fn test_stat_failure_is_an_error_not_a_missing_file() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, "SCAN_SITE domain=keep.com\n").unwrap();
        let source = FileSource::new(blocker.join("commands.txt"));

        let err = source.ensure_exists().await.unwrap_err();
        assert!(matches!(err, SourceError::Read { .. }));
        assert_eq!(
            std::fs::read_to_string(&blocker).unwrap(),
            "SCAN_SITE domain=keep.com\n"
        );
    }

    #[tokio::test]
    async fn test_blank_and_comment_lines_skipped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("commands.txt");
        std::fs::write(
            &path,
            "# header\n\n  SCAN_SITE domain=example.com  \n   # indented comment\nKILL_SWITCH\n",
        )
        .unwrap();

        let lines = FileSource::new(&path).read_lines().await.unwrap();
        assert_eq!(lines, vec!["SCAN_SITE domain=example.com", "KILL_SWITCH"]);
    }

    #[tokio::test]
    async fn test_memory_source_accumulates() {
        let source = MemorySource::new();
        source.push_line("SCAN_SITE domain=a.com").await;
        source.push_line("").await;
        source.push_line("SCAN_SITE domain=b.com").await;

        assert_eq!(source.read_lines().await.unwrap().len(), 2);
        assert_eq!(source.describe(), "memory");
    }
}
