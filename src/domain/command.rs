//! Command kinds and their typed parameters.
//!
//! A raw line names a [`TaskKind`]; once validated, its `key=value` tokens
//! become a [`TaskParams`] variant carrying a struct specific to that kind.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every command keyword the marketplace recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    ScanSite,
    PublishReport,
    DistributeContent,
    UpdateNotion,
    KillSwitch,
    StartCampaign,
    RefactorCode,
    ProvisionInfra,
    CheckIntegrationStatus,
    RefreshToken,
    SyncAudience,
}

impl TaskKind {
    pub const ALL: [TaskKind; 11] = [
        TaskKind::ScanSite,
        TaskKind::PublishReport,
        TaskKind::DistributeContent,
        TaskKind::UpdateNotion,
        TaskKind::KillSwitch,
        TaskKind::StartCampaign,
        TaskKind::RefactorCode,
        TaskKind::ProvisionInfra,
        TaskKind::CheckIntegrationStatus,
        TaskKind::RefreshToken,
        TaskKind::SyncAudience,
    ];

    /// Wire name, as written in command lines and task records
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::ScanSite => "SCAN_SITE",
            TaskKind::PublishReport => "PUBLISH_REPORT",
            TaskKind::DistributeContent => "DISTRIBUTE_CONTENT",
            TaskKind::UpdateNotion => "UPDATE_NOTION",
            TaskKind::KillSwitch => "KILL_SWITCH",
            TaskKind::StartCampaign => "START_CAMPAIGN",
            TaskKind::RefactorCode => "REFACTOR_CODE",
            TaskKind::ProvisionInfra => "PROVISION_INFRA",
            TaskKind::CheckIntegrationStatus => "CHECK_INTEGRATION_STATUS",
            TaskKind::RefreshToken => "REFRESH_TOKEN",
            TaskKind::SyncAudience => "SYNC_AUDIENCE",
        }
    }

    /// Kinds that travel through the queue. The kill switch never does.
    pub fn queued() -> impl Iterator<Item = TaskKind> {
        Self::ALL.into_iter().filter(|k| *k != TaskKind::KillSwitch)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = CommandError;

    /// Case-insensitive keyword lookup
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == upper)
            .ok_or_else(|| CommandError::UnknownCommand(s.to_string()))
    }
}

/// Why a known command was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{command}: missing required field '{field}'")]
    MissingField { command: TaskKind, field: String },

    #[error("{command}: field '{field}' has invalid value '{value}' (allowed: {allowed})")]
    InvalidValue {
        command: TaskKind,
        field: String,
        value: String,
        allowed: String,
    },

    #[error("{command}: unknown field '{field}'")]
    UnknownField { command: TaskKind, field: String },
}

impl ValidationError {
    /// The field this error is about
    pub fn field(&self) -> &str {
        match self {
            Self::MissingField { field, .. }
            | Self::InvalidValue { field, .. }
            | Self::UnknownField { field, .. } => field,
        }
    }
}

/// Why a raw line never became a command
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("empty command line")]
    Empty,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// Output format of a PUBLISH_REPORT command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Pdf,
    Csv,
}

impl ReportFormat {
    pub const ALLOWED: [&'static str; 2] = ["pdf", "csv"];

    pub fn as_str(self) -> &'static str {
        match self {
            ReportFormat::Pdf => "pdf",
            ReportFormat::Csv => "csv",
        }
    }
}

impl FromStr for ReportFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pdf" => Ok(ReportFormat::Pdf),
            "csv" => Ok(ReportFormat::Csv),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSite {
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub client: String,
    pub dataset: String,
    pub format: ReportFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributeContent {
    pub content_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateNotion {
    pub page_id: String,
    pub content: String,
}

/// Parameters of a handler-defined command, passed through untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenParams(pub BTreeMap<String, String>);

impl OpenParams {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// Typed parameters, one variant per [`TaskKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskParams {
    ScanSite(ScanSite),
    PublishReport(PublishReport),
    DistributeContent(DistributeContent),
    UpdateNotion(UpdateNotion),
    KillSwitch,
    StartCampaign(OpenParams),
    RefactorCode(OpenParams),
    ProvisionInfra(OpenParams),
    CheckIntegrationStatus(OpenParams),
    RefreshToken(OpenParams),
    SyncAudience(OpenParams),
}

impl TaskParams {
    /// Build typed parameters from a flat `key=value` map.
    ///
    /// Only extracts the fields each variant needs; the schema check for
    /// unknown fields lives in the validator.
    pub fn build(kind: TaskKind, params: &BTreeMap<String, String>) -> Result<Self, ValidationError> {
        let typed = match kind {
            TaskKind::ScanSite => TaskParams::ScanSite(ScanSite {
                domain: required(kind, params, "domain")?,
            }),
            TaskKind::PublishReport => {
                let raw_format = required(kind, params, "format")?;
                let format = raw_format.parse::<ReportFormat>().map_err(|_| {
                    ValidationError::InvalidValue {
                        command: kind,
                        field: "format".to_string(),
                        value: raw_format.clone(),
                        allowed: ReportFormat::ALLOWED.join(", "),
                    }
                })?;
                TaskParams::PublishReport(PublishReport {
                    client: required(kind, params, "client")?,
                    dataset: required(kind, params, "dataset")?,
                    format,
                })
            }
            TaskKind::DistributeContent => TaskParams::DistributeContent(DistributeContent {
                content_file: required(kind, params, "content_file")?,
            }),
            TaskKind::UpdateNotion => TaskParams::UpdateNotion(UpdateNotion {
                page_id: required(kind, params, "page_id")?,
                content: required(kind, params, "content")?,
            }),
            TaskKind::KillSwitch => TaskParams::KillSwitch,
            TaskKind::StartCampaign => TaskParams::StartCampaign(OpenParams(params.clone())),
            TaskKind::RefactorCode => TaskParams::RefactorCode(OpenParams(params.clone())),
            TaskKind::ProvisionInfra => TaskParams::ProvisionInfra(OpenParams(params.clone())),
            TaskKind::CheckIntegrationStatus => {
                TaskParams::CheckIntegrationStatus(OpenParams(params.clone()))
            }
            TaskKind::RefreshToken => TaskParams::RefreshToken(OpenParams(params.clone())),
            TaskKind::SyncAudience => TaskParams::SyncAudience(OpenParams(params.clone())),
        };
        Ok(typed)
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskParams::ScanSite(_) => TaskKind::ScanSite,
            TaskParams::PublishReport(_) => TaskKind::PublishReport,
            TaskParams::DistributeContent(_) => TaskKind::DistributeContent,
            TaskParams::UpdateNotion(_) => TaskKind::UpdateNotion,
            TaskParams::KillSwitch => TaskKind::KillSwitch,
            TaskParams::StartCampaign(_) => TaskKind::StartCampaign,
            TaskParams::RefactorCode(_) => TaskKind::RefactorCode,
            TaskParams::ProvisionInfra(_) => TaskKind::ProvisionInfra,
            TaskParams::CheckIntegrationStatus(_) => TaskKind::CheckIntegrationStatus,
            TaskParams::RefreshToken(_) => TaskKind::RefreshToken,
            TaskParams::SyncAudience(_) => TaskKind::SyncAudience,
        }
    }
}

fn required(
    kind: TaskKind,
    params: &BTreeMap<String, String>,
    field: &str,
) -> Result<String, ValidationError> {
    params
        .get(field)
        .cloned()
        .ok_or_else(|| ValidationError::MissingField {
            command: kind,
            field: field.to_string(),
        })
}

/// A validated command. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    kind: TaskKind,
    params: BTreeMap<String, String>,
    raw: String,
}

impl Command {
    pub fn new(kind: TaskKind, params: BTreeMap<String, String>, raw: impl Into<String>) -> Self {
        Self {
            kind,
            params,
            raw: raw.into(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}
