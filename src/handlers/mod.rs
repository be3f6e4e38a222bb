//! Task handlers.
//!
//! A [`Handler`] executes one [`TaskKind`]. Workers look handlers up in a
//! [`HandlerSet`]; the kinds present in the set are exactly the topics the
//! worker claims from.

pub mod content;
pub mod simulated;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::{TaskKind, TaskParams, ValidationError};

pub use content::ContentDistributor;
pub use simulated::{
    CampaignHandler, IntegrationStatusHandler, NotionHandler, ProvisionHandler, RefactorHandler,
    RefreshTokenHandler, ReportHandler, SiteScanHandler, SyncAudienceHandler,
};

/// Data a handler reports back on success
pub type HandlerOutput = Map<String, Value>;

/// Handler failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Worth another attempt
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retrying cannot help
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

impl From<ValidationError> for HandlerError {
    fn from(e: ValidationError) -> Self {
        HandlerError::Fatal(e.to_string())
    }
}

/// Executes tasks of one kind
#[async_trait]
pub trait Handler: Send + Sync {
    fn kind(&self) -> TaskKind;

    async fn execute(&self, params: &TaskParams) -> Result<HandlerOutput, HandlerError>;
}

/// Error for a handler handed parameters of another kind
pub(crate) fn wrong_params(expected: TaskKind, got: &TaskParams) -> HandlerError {
    HandlerError::Fatal(format!(
        "{expected} handler received {} parameters",
        got.kind()
    ))
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Handler for task kind '{0}' is already registered")]
    DuplicateHandler(TaskKind),

    #[error("{0} is handled by the producer, not by workers")]
    NotQueued(TaskKind),
}

/// Handlers keyed by the kind they execute
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: HashMap<TaskKind, Arc<dyn Handler>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in handler, with content distribution configured by `distributor`
    pub fn builtin(distributor: ContentDistributor) -> Result<Self, RegistryError> {
        let mut set = Self::new();
        set.register(SiteScanHandler)?;
        set.register(ReportHandler)?;
        set.register(distributor)?;
        set.register(NotionHandler)?;
        set.register(CampaignHandler)?;
        set.register(RefactorHandler)?;
        set.register(ProvisionHandler)?;
        set.register(IntegrationStatusHandler)?;
        set.register(RefreshTokenHandler)?;
        set.register(SyncAudienceHandler)?;
        Ok(set)
    }

    pub fn register<H: Handler + 'static>(&mut self, handler: H) -> Result<(), RegistryError> {
        let kind = handler.kind();
        if kind == TaskKind::KillSwitch {
            return Err(RegistryError::NotQueued(kind));
        }
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::DuplicateHandler(kind));
        }
        self.handlers.insert(kind, Arc::new(handler));
        Ok(())
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Registered kinds, in declaration order
    pub fn kinds(&self) -> Vec<TaskKind> {
        TaskKind::ALL
            .into_iter()
            .filter(|k| self.handlers.contains_key(k))
            .collect()
    }

    /// Keep only the handlers for `kinds`
    pub fn only(mut self, kinds: &[TaskKind]) -> Self {
        self.handlers.retain(|kind, _| kinds.contains(kind));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
