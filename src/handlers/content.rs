//! DISTRIBUTE_CONTENT: load a content file and fan it out to platforms.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{wrong_params, Handler, HandlerError, HandlerOutput};
use crate::core::SafetyLimits;
use crate::domain::{TaskKind, TaskParams};

/// Platforms with a posting client
const POSTING_PLATFORMS: [&str; 5] = ["Twitter", "LinkedIn", "Facebook", "Reddit", "Email Newsletter"];

/// Platforms that need media and are only simulated
const MEDIA_PLATFORMS: [&str; 1] = ["Instagram"];

pub fn default_platforms() -> Vec<String> {
    POSTING_PLATFORMS
        .iter()
        .chain(MEDIA_PLATFORMS.iter())
        .map(|p| p.to_string())
        .collect()
}

/// Reads content files under `base_dir` and distributes them
#[derive(Debug, Clone)]
pub struct ContentDistributor {
    base_dir: PathBuf,
    platforms: Vec<String>,
    limits: SafetyLimits,
}

impl Default for ContentDistributor {
    fn default() -> Self {
        Self::new(PathBuf::from("."), default_platforms(), SafetyLimits::default())
    }
}

impl ContentDistributor {
    pub fn new(base_dir: PathBuf, platforms: Vec<String>, limits: SafetyLimits) -> Self {
        Self {
            base_dir,
            platforms,
            limits,
        }
    }

    /// Resolve a content path; relative paths are taken from `base_dir`
    pub fn resolve(&self, content_file: &str) -> PathBuf {
        let path = PathBuf::from(content_file);
        if path.is_absolute() {
            path
        } else {
            self.base_dir.join(path)
        }
    }

    /// Per-platform delivery status for one piece of content
    fn distribute(&self, content: &str) -> BTreeMap<String, String> {
        self.platforms
            .iter()
            .map(|platform| {
                let status = if POSTING_PLATFORMS.contains(&platform.as_str()) {
                    info!(platform = %platform, chars = content.chars().count(), "Posting content");
                    "success"
                } else if MEDIA_PLATFORMS.contains(&platform.as_str()) {
                    "simulated_success"
                } else {
                    warn!(platform = %platform, "Unknown platform");
                    "unknown_platform"
                };
                (platform.clone(), status.to_string())
            })
            .collect()
    }
}

#[async_trait]
impl Handler for ContentDistributor {
    fn kind(&self) -> TaskKind {
        TaskKind::DistributeContent
    }

    async fn execute(&self, params: &TaskParams) -> Result<HandlerOutput, HandlerError> {
        let TaskParams::DistributeContent(request) = params else {
            return Err(wrong_params(self.kind(), params));
        };

        let path = self.resolve(&request.content_file);
        self.limits
            .validate_path(&path)
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;

        let not_found =
            || HandlerError::Fatal(format!("Content file not found: {}", request.content_file));
        let read_failed = |e: std::io::Error| {
            HandlerError::Transient(format!("Failed to read {}: {e}", path.display()))
        };

        // Size is checked before anything is loaded.
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(read_failed(e)),
        };
        self.limits
            .validate_size(size)
            .map_err(|e| HandlerError::Fatal(e.to_string()))?;

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(read_failed(e)),
        };

        let chars = content.chars().count();
        info!(file = %request.content_file, chars, "Distributing content");
        let platforms = self.distribute(&content);

        let mut out = HandlerOutput::new();
        out.insert("content_file".to_string(), Value::from(request.content_file.clone()));
        out.insert("chars".to_string(), Value::from(chars));
        out.insert("platforms".to_string(), json!(platforms));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::domain::DistributeContent;

    fn params(file: &str) -> TaskParams {
        TaskParams::DistributeContent(DistributeContent {
            content_file: file.to_string(),
        })
    }

    fn distributor(dir: &TempDir, platforms: &[&str]) -> ContentDistributor {
        ContentDistributor::new(
            dir.path().to_path_buf(),
            platforms.iter().map(|p| p.to_string()).collect(),
            SafetyLimits::default(),
        )
    }

    #[tokio::test]
    async fn test_distributes_relative_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("post.txt"), "Hello, world").unwrap();

        let handler = distributor(&dir, &["Twitter", "Instagram", "MySpace"]);
        let out = handler.execute(&params("post.txt")).await.unwrap();

        assert_eq!(out["chars"], 12);
        assert_eq!(out["platforms"]["Twitter"], "success");
        assert_eq!(out["platforms"]["Instagram"], "simulated_success");
        assert_eq!(out["platforms"]["MySpace"], "unknown_platform");
    }

    #[tokio::test]
    async fn test_missing_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let handler = distributor(&dir, &["Twitter"]);

        let err = handler.execute(&params("nope.txt")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Fatal(ref msg) if msg.contains("not found")));
    }

    #[tokio::test]
    async fn test_denylisted_file_is_never_read() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".env"), "SECRET=1").unwrap();
        let handler = distributor(&dir, &["Twitter"]);

        let err = handler.execute(&params(".env")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Fatal(ref msg) if msg.contains("denylist")));
    }

    #[tokio::test]
    async fn test_oversized_file_rejected_before_read() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(64)).unwrap();
        let limits = SafetyLimits {
            max_content_bytes: 16,
            ..SafetyLimits::default()
        };
        let handler = ContentDistributor::new(
            dir.path().to_path_buf(),
            vec!["Twitter".to_string()],
            limits,
        );

        let err = handler.execute(&params("big.txt")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Fatal(ref msg) if msg.contains("64 bytes > 16 bytes")));
    }

    #[test]
    fn test_resolve_keeps_absolute_paths() {
        let handler = ContentDistributor::default();
        assert_eq!(handler.resolve("/tmp/a.txt"), PathBuf::from("/tmp/a.txt"));
        assert_eq!(handler.resolve("a.txt"), PathBuf::from("./a.txt"));
    }
}
