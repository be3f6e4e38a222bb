//! Safety limits for content that handlers read from disk.
//!
//! Guards the content-distribution path against:
//! - Denylisted files (secrets, keys, env files)
//! - Oversized content

use std::path::Path;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Limits applied before a handler loads or publishes a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Maximum content size in bytes (default: 1MB)
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: u64,

    /// Glob patterns to reject (files matching these won't be read)
    #[serde(default = "default_denylist")]
    pub denylist_patterns: Vec<String>,
}

fn default_max_content_bytes() -> u64 {
    1024 * 1024
}

fn default_denylist() -> Vec<String> {
    vec![
        "**/.env*".to_string(),
        "**/secrets*".to_string(),
        "**/*credential*".to_string(),
        "**/*.pem".to_string(),
        "**/*.key".to_string(),
    ]
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_content_bytes: default_max_content_bytes(),
            denylist_patterns: default_denylist(),
        }
    }
}

impl SafetyLimits {
    /// Check if a path matches any denylist pattern
    pub fn is_denylisted(&self, path: &str) -> bool {
        self.denylist_patterns
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .any(|pattern| pattern.matches(path))
    }

    /// Reject denylisted paths
    pub fn validate_path(&self, path: &Path) -> Result<(), SafetyViolation> {
        let path_str = path.to_string_lossy();
        if self.is_denylisted(&path_str) {
            return Err(SafetyViolation::DenylistMatch {
                path: path_str.to_string(),
            });
        }
        Ok(())
    }

    /// Reject content over the size limit
    pub fn validate_size(&self, size: u64) -> Result<(), SafetyViolation> {
        if size > self.max_content_bytes {
            return Err(SafetyViolation::MaxContentBytes {
                actual: size,
                limit: self.max_content_bytes,
            });
        }
        Ok(())
    }
}

/// Safety limit violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    #[error("Content size exceeded: {actual} bytes > {limit} bytes limit")]
    MaxContentBytes { actual: u64, limit: u64 },

    #[error("Path matches denylist pattern: {path}")]
    DenylistMatch { path: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_denylist() {
        let limits = SafetyLimits::default();

        assert!(limits.is_denylisted("/app/.env"));
        assert!(limits.is_denylisted("/app/.env.local"));
        assert!(limits.is_denylisted("/config/secrets.yaml"));
        assert!(limits.is_denylisted("/keys/server.pem"));
        assert!(!limits.is_denylisted("/content/post.txt"));
    }

    #[test]
    fn test_validate_path() {
        let limits = SafetyLimits::default();
        assert!(limits.validate_path(Path::new("/content/post.txt")).is_ok());
        assert!(matches!(
            limits.validate_path(Path::new("/home/me/aws_credentials.txt")),
            Err(SafetyViolation::DenylistMatch { .. })
        ));
    }

    #[test]
    fn test_validate_size() {
        let limits = SafetyLimits {
            max_content_bytes: 10,
            ..Default::default()
        };

        assert!(limits.validate_size(5).is_ok());
        assert!(limits.validate_size(10).is_ok());
        assert!(matches!(
            limits.validate_size(16),
            Err(SafetyViolation::MaxContentBytes { actual: 16, limit: 10 })
        ));
    }

    #[test]
    fn test_limits_deserialize_with_defaults() {
        let limits: SafetyLimits = serde_yaml::from_str("max_content_bytes: 42").unwrap();
        assert_eq!(limits.max_content_bytes, 42);
        assert_eq!(limits.denylist_patterns, default_denylist());
    }
}
