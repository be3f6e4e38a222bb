//! Parse raw command lines and check them against per-kind schemas.
//!
//! Grammar: `COMMAND_NAME key1=value1 key2=value2 ...`. The keyword is
//! case-insensitive; tokens without `=` are ignored; a value runs up to the
//! next space and may itself contain `=`; a repeated key keeps its last value.

use std::collections::BTreeMap;

use crate::domain::{Command, CommandError, ReportFormat, TaskKind, TaskParams, ValidationError};

/// Accepted values of one field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRule {
    /// Any non-empty string
    Text,
    /// One of a fixed set
    OneOf(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub required: bool,
    pub rule: FieldRule,
}

const fn required(name: &'static str, rule: FieldRule) -> FieldSpec {
    FieldSpec {
        name,
        required: true,
        rule,
    }
}

/// Parameter schema of one command kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schema {
    pub fields: &'static [FieldSpec],
    /// Reject fields not listed in `fields`
    pub strict: bool,
}

const SCAN_SITE: Schema = Schema {
    fields: &[required("domain", FieldRule::Text)],
    strict: true,
};

const PUBLISH_REPORT: Schema = Schema {
    fields: &[
        required("client", FieldRule::Text),
        required("dataset", FieldRule::Text),
        required("format", FieldRule::OneOf(&ReportFormat::ALLOWED)),
    ],
    strict: true,
};

const DISTRIBUTE_CONTENT: Schema = Schema {
    fields: &[required("content_file", FieldRule::Text)],
    strict: true,
};

const UPDATE_NOTION: Schema = Schema {
    fields: &[
        required("page_id", FieldRule::Text),
        required("content", FieldRule::Text),
    ],
    strict: true,
};

const KILL_SWITCH: Schema = Schema {
    fields: &[],
    strict: true,
};

/// Parameters are defined by the receiving handler
const HANDLER_DEFINED: Schema = Schema {
    fields: &[],
    strict: false,
};

/// Schema registered for a command kind
pub fn schema_for(kind: TaskKind) -> Schema {
    match kind {
        TaskKind::ScanSite => SCAN_SITE,
        TaskKind::PublishReport => PUBLISH_REPORT,
        TaskKind::DistributeContent => DISTRIBUTE_CONTENT,
        TaskKind::UpdateNotion => UPDATE_NOTION,
        TaskKind::KillSwitch => KILL_SWITCH,
        TaskKind::StartCampaign
        | TaskKind::RefactorCode
        | TaskKind::ProvisionInfra
        | TaskKind::CheckIntegrationStatus
        | TaskKind::RefreshToken
        | TaskKind::SyncAudience => HANDLER_DEFINED,
    }
}

/// Split a line into its keyword and `key=value` parameters
pub fn tokenize(raw: &str) -> Option<(&str, BTreeMap<String, String>)> {
    let mut tokens = raw.split_whitespace();
    let keyword = tokens.next()?;
    let params = tokens
        .filter_map(|token| token.split_once('='))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    Some((keyword, params))
}

/// Turns raw lines into validated [`Command`]s. Pure apart from the result.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandValidator;

impl CommandValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, raw: &str) -> Result<Command, CommandError> {
        let (keyword, params) = tokenize(raw).ok_or(CommandError::Empty)?;
        let kind: TaskKind = keyword.parse()?;
        self.check(kind, &params)?;

        // Every schema-valid map also decodes into its typed parameters.
        TaskParams::build(kind, &params)?;
        Ok(Command::new(kind, params, raw))
    }

    /// Check `params` against the schema of `kind`
    pub fn check(&self, kind: TaskKind, params: &BTreeMap<String, String>) -> Result<(), ValidationError> {
        let schema = schema_for(kind);

        for field in schema.fields {
            let value = params.get(field.name).filter(|v| !v.is_empty());
            let Some(value) = value else {
                if field.required {
                    return Err(ValidationError::MissingField {
                        command: kind,
                        field: field.name.to_string(),
                    });
                }
                continue;
            };

            if let FieldRule::OneOf(allowed) = field.rule {
                if !allowed.contains(&value.as_str()) {
                    return Err(ValidationError::InvalidValue {
                        command: kind,
                        field: field.name.to_string(),
                        value: value.clone(),
                        allowed: allowed.join(", "),
                    });
                }
            }
        }

        if schema.strict {
            if let Some(unknown) = params
                .keys()
                .find(|key| !schema.fields.iter().any(|f| f.name == key.as_str()))
            {
                return Err(ValidationError::UnknownField {
                    command: kind,
                    field: unknown.clone(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<Command, CommandError> {
        CommandValidator::new().parse(raw)
    }

    #[test]
    fn test_tokenize() {
        let (keyword, params) = tokenize("scan_site domain=a=b stray x=1 x=2 =orphan").unwrap();
        assert_eq!(keyword, "scan_site");
        assert_eq!(params.get("domain").map(String::as_str), Some("a=b"));
        assert_eq!(params.get("x").map(String::as_str), Some("2"));
        assert_eq!(params.len(), 2);
        assert!(tokenize("   ").is_none());
    }

    #[test]
    fn test_keyword_case_insensitive() {
        let cmd = parse("scan_site domain=example.com").unwrap();
        assert_eq!(cmd.kind(), TaskKind::ScanSite);
        assert_eq!(cmd.raw(), "scan_site domain=example.com");
    }

    #[test]
    fn test_unknown_and_empty() {
        assert!(matches!(parse("LAUNCH x=1"), Err(CommandError::UnknownCommand(k)) if k == "LAUNCH"));
        assert!(matches!(parse(""), Err(CommandError::Empty)));
    }

    #[test]
    fn test_missing_and_empty_values() {
        let err = parse("UPDATE_NOTION page_id=p1").unwrap_err();
        assert!(matches!(
            err,
            CommandError::Validation(ValidationError::MissingField { ref field, .. }) if field == "content"
        ));

        let err = parse("SCAN_SITE domain=").unwrap_err();
        assert!(matches!(err, CommandError::Validation(ValidationError::MissingField { .. })));
    }

    #[test]
    fn test_strict_schema_rejects_unknown_fields() {
        let err = parse("SCAN_SITE domain=example.com depth=3").unwrap_err();
        assert!(matches!(
            err,
            CommandError::Validation(ValidationError::UnknownField { ref field, .. }) if field == "depth"
        ));
    }

    #[test]
    fn test_handler_defined_kinds_accept_anything() {
        let cmd = parse("SYNC_AUDIENCE audience_id=a1 dest_platform=meta extra=1").unwrap();
        assert_eq!(cmd.params().len(), 3);
        assert!(parse("PROVISION_INFRA").is_ok());
    }

    #[test]
    fn test_kill_switch_takes_no_params() {
        assert!(parse("KILL_SWITCH").is_ok());
        assert!(parse("kill_switch now").is_ok());
        assert!(parse("KILL_SWITCH reason=test").is_err());
    }
}
