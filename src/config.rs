//! Configuration for agentkit.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (AGENTKIT_HOME, AGENTKIT_STORE, AGENTKIT_COMMANDS)
//! 2. Config file (.agentkit/config.yaml)
//! 3. Defaults (~/.agentkit)
//!
//! Config file discovery:
//! - Searches the start directory and its parents for .agentkit/config.yaml
//! - `paths.home` is relative to the .agentkit/ directory; every other path
//!   is relative to the project root (the parent of .agentkit/)
//!
//! The configuration is loaded once by the binary and passed down
//! explicitly; nothing here is cached globally.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::{RetryPolicy, SafetyLimits};
use crate::handlers::content::{default_platforms, ContentDistributor};
use crate::market::Marketplace;

pub const ENV_HOME: &str = "AGENTKIT_HOME";
pub const ENV_STORE: &str = "AGENTKIT_STORE";
pub const ENV_COMMANDS: &str = "AGENTKIT_COMMANDS";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub auditor: AuditorConfig,
    pub retention_hours: Option<u64>,
    #[serde(default)]
    pub content: ContentConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .agentkit/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    pub backend: Option<StoreBackend>,
    pub path: Option<String>,
}

/// Where the marketplace lives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Single process only
    Memory,
    /// Shared SQLite file
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollerConfig {
    pub command_file: Option<String>,
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerConfig {
    pub claim_timeout_secs: Option<u64>,
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditorConfig {
    pub ledger_path: Option<String>,
    pub signed_by: Option<String>,
    pub replay: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentConfig {
    pub base_dir: Option<String>,
    pub platforms: Option<Vec<String>>,
    pub denylist_patterns: Option<Vec<String>>,
    pub max_content_bytes: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub store: StoreSettings,
    pub poller: PollerSettings,
    pub worker: WorkerSettings,
    pub auditor: AuditorSettings,
    /// How long finished tasks are kept
    pub retention: chrono::Duration,
    pub content: ContentSettings,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub command_file: PathBuf,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub claim_timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct AuditorSettings {
    pub ledger_path: PathBuf,
    pub signed_by: String,
    /// Replay the whole result log on start (durable store only)
    pub replay: bool,
}

#[derive(Debug, Clone)]
pub struct ContentSettings {
    pub base_dir: PathBuf,
    pub platforms: Vec<String>,
    pub limits: SafetyLimits,
}

impl ResolvedConfig {
    /// Load from the config file found above the current directory, the
    /// process environment and defaults
    pub fn load() -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to determine current directory")?;
        Self::load_from(&cwd, |key| std::env::var(key).ok())
    }

    /// Load with an explicit start directory and environment lookup
    pub fn load_from(start: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let default_home = dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".agentkit");

        let found = match find_config_file(start) {
            Some(path) => {
                let file = load_config_file(&path)?;
                Some((path, file))
            }
            None => None,
        };

        Ok(Self::resolve(found, start, default_home, env))
    }

    fn resolve(
        found: Option<(PathBuf, ConfigFile)>,
        start: &Path,
        default_home: PathBuf,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let (config_file, file) = match found {
            Some((path, file)) => (Some(path), file),
            None => (None, ConfigFile::default()),
        };

        // .agentkit/ and the project root above it
        let (dot_dir, base_dir) = match config_file.as_deref() {
            Some(path) => {
                let dot_dir = path.parent().unwrap_or(start).to_path_buf();
                let base_dir = dot_dir.parent().unwrap_or(start).to_path_buf();
                (dot_dir, base_dir)
            }
            None => (start.to_path_buf(), start.to_path_buf()),
        };

        let home = env(ENV_HOME)
            .map(PathBuf::from)
            .or_else(|| file.paths.home.as_deref().map(|h| resolve_path(&dot_dir, h)))
            .unwrap_or(default_home);

        let store = StoreSettings {
            backend: file.store.backend.unwrap_or_default(),
            path: env(ENV_STORE)
                .map(PathBuf::from)
                .or_else(|| file.store.path.as_deref().map(|p| resolve_path(&base_dir, p)))
                .unwrap_or_else(|| home.join("market.db")),
        };

        let poller = PollerSettings {
            command_file: env(ENV_COMMANDS)
                .map(PathBuf::from)
                .or_else(|| {
                    file.poller
                        .command_file
                        .as_deref()
                        .map(|p| resolve_path(&base_dir, p))
                })
                .unwrap_or_else(|| home.join("commands.txt")),
            interval: Duration::from_secs(file.poller.interval_secs.unwrap_or(5)),
        };

        let worker = WorkerSettings {
            claim_timeout: Duration::from_secs(file.worker.claim_timeout_secs.unwrap_or(30)),
            retry: file.worker.retry.unwrap_or_default(),
        };

        let auditor = AuditorSettings {
            ledger_path: file
                .auditor
                .ledger_path
                .as_deref()
                .map(|p| resolve_path(&base_dir, p))
                .unwrap_or_else(|| home.join("ledger.jsonl")),
            signed_by: file
                .auditor
                .signed_by
                .unwrap_or_else(|| "AuditorAgent".to_string()),
            replay: file.auditor.replay.unwrap_or(false),
        };

        let retention_hours = i64::try_from(file.retention_hours.unwrap_or(168)).unwrap_or(168);

        let mut limits = SafetyLimits::default();
        if let Some(patterns) = file.content.denylist_patterns {
            limits.denylist_patterns = patterns;
        }
        if let Some(max) = file.content.max_content_bytes {
            limits.max_content_bytes = max;
        }
        let content = ContentSettings {
            base_dir: file
                .content
                .base_dir
                .as_deref()
                .map(|p| resolve_path(&base_dir, p))
                .unwrap_or_else(|| base_dir.clone()),
            platforms: file.content.platforms.unwrap_or_else(default_platforms),
            limits,
        };

        Self {
            home,
            config_file,
            store,
            poller,
            worker,
            auditor,
            retention: chrono::Duration::hours(retention_hours),
            content,
        }
    }

    /// Open the configured marketplace
    pub fn open_marketplace(&self) -> Result<Marketplace> {
        match self.store.backend {
            StoreBackend::Memory => Ok(Marketplace::in_memory()),
            StoreBackend::Sqlite => Marketplace::sqlite(&self.store.path).with_context(|| {
                format!("Failed to open store: {}", self.store.path.display())
            }),
        }
    }

    /// The DISTRIBUTE_CONTENT handler for these settings
    pub fn content_distributor(&self) -> ContentDistributor {
        ContentDistributor::new(
            self.content.base_dir.clone(),
            self.content.platforms.clone(),
            self.content.limits.clone(),
        )
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".agentkit").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_file() {
        let temp = TempDir::new().unwrap();
        let home = PathBuf::from("/home/test/.agentkit");
        let config = ResolvedConfig::resolve(None, temp.path(), home.clone(), no_env);

        assert_eq!(config.home, home);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.path, home.join("market.db"));
        assert_eq!(config.poller.command_file, home.join("commands.txt"));
        assert_eq!(config.poller.interval, Duration::from_secs(5));
        assert_eq!(config.worker.claim_timeout, Duration::from_secs(30));
        assert_eq!(config.worker.retry, RetryPolicy::default());
        assert_eq!(config.auditor.signed_by, "AuditorAgent");
        assert!(!config.auditor.replay);
        assert_eq!(config.retention, chrono::Duration::hours(168));
        assert_eq!(config.content.base_dir, temp.path());
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_config_file_discovered_from_subdirectory() {
        let temp = TempDir::new().unwrap();
        let dot_dir = temp.path().join(".agentkit");
        std::fs::create_dir_all(&dot_dir).unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let config_path = dot_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1"
paths:
  home: state
store:
  backend: memory
poller:
  command_file: commands/inbox.txt
  interval_secs: 1
worker:
  claim_timeout_secs: 2
  retry:
    max_attempts: 5
auditor:
  signed_by: Ledgerbot
  replay: true
retention_hours: 24
content:
  base_dir: content
  platforms: [Twitter]
  denylist_patterns: ["**/*.secret"]
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        assert_eq!(parsed.version.as_deref(), Some("1"));
        let config = ResolvedConfig::resolve(
            Some((config_path.clone(), parsed)),
            &nested,
            PathBuf::from("/unused"),
            no_env,
        );

        assert_eq!(find_config_file(&nested), Some(config_path.clone()));
        assert_eq!(config.home, dot_dir.join("state"));
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.path, dot_dir.join("state").join("market.db"));
        assert_eq!(config.poller.command_file, temp.path().join("commands/inbox.txt"));
        assert_eq!(config.poller.interval, Duration::from_secs(1));
        assert_eq!(config.worker.retry.max_attempts, 5);
        assert_eq!(config.worker.retry.initial_delay_ms, 2000);
        assert_eq!(config.auditor.signed_by, "Ledgerbot");
        assert!(config.auditor.replay);
        assert_eq!(config.retention, chrono::Duration::hours(24));
        assert_eq!(config.content.base_dir, temp.path().join("content"));
        assert_eq!(config.content.platforms, vec!["Twitter".to_string()]);
        assert!(config.content.limits.is_denylisted("/x/y.secret"));
    }

    #[test]
    fn test_env_overrides_win() {
        let temp = TempDir::new().unwrap();
        let env: HashMap<&str, &str> = [
            (ENV_HOME, "/srv/agentkit"),
            (ENV_STORE, "/srv/shared/market.db"),
            (ENV_COMMANDS, "/srv/inbox.txt"),
        ]
        .into_iter()
        .collect();

        let config = ResolvedConfig::resolve(None, temp.path(), PathBuf::from("/unused"), |k| {
            env.get(k).map(|v| v.to_string())
        });

        assert_eq!(config.home, PathBuf::from("/srv/agentkit"));
        assert_eq!(config.store.path, PathBuf::from("/srv/shared/market.db"));
        assert_eq!(config.poller.command_file, PathBuf::from("/srv/inbox.txt"));
        assert_eq!(config.auditor.ledger_path, PathBuf::from("/srv/agentkit/ledger.jsonl"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/./subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
