//! Stand-ins for the external specialists.
//!
//! Each handler validates its typed parameters and reports what the real
//! integration would have returned; none of them leaves the process.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{wrong_params, Handler, HandlerError, HandlerOutput};
use crate::domain::{OpenParams, TaskKind, TaskParams};

/// Services whose integration health can be checked
const KNOWN_SERVICES: [&str; 2] = ["mailchimp", "meta_lead_ads"];

fn output(value: Value) -> HandlerOutput {
    match value {
        Value::Object(map) => map,
        _ => HandlerOutput::new(),
    }
}

fn required<'a>(kind: TaskKind, params: &'a OpenParams, key: &str) -> Result<&'a str, HandlerError> {
    params
        .get(key)
        .ok_or_else(|| HandlerError::Fatal(format!("{kind}: missing parameter '{key}'")))
}

pub struct SiteScanHandler;

#[async_trait]
impl Handler for SiteScanHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::ScanSite
    }

    async fn execute(&self, params: &TaskParams) -> Result<HandlerOutput, HandlerError> {
        let TaskParams::ScanSite(scan) = params else {
            return Err(wrong_params(self.kind(), params));
        };
        info!(domain = %scan.domain, "Scanning site");
        Ok(output(json!({ "domain": scan.domain, "scanned": true })))
    }
}

pub struct ReportHandler;

#[async_trait]
impl Handler for ReportHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::PublishReport
    }

    async fn execute(&self, params: &TaskParams) -> Result<HandlerOutput, HandlerError> {
        let TaskParams::PublishReport(report) = params else {
            return Err(wrong_params(self.kind(), params));
        };
        let file_name = format!(
            "{}_{}.{}",
            report.client,
            report.dataset,
            report.format.as_str()
        );
        info!(client = %report.client, file = %file_name, "Publishing report");
        Ok(output(json!({
            "client": report.client,
            "dataset": report.dataset,
            "format": report.format.as_str(),
            "report_file": file_name,
        })))
    }
}

pub struct NotionHandler;

#[async_trait]
impl Handler for NotionHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::UpdateNotion
    }

    async fn execute(&self, params: &TaskParams) -> Result<HandlerOutput, HandlerError> {
        let TaskParams::UpdateNotion(update) = params else {
            return Err(wrong_params(self.kind(), params));
        };
        info!(page_id = %update.page_id, "Updating Notion page");
        Ok(output(json!({
            "page_id": update.page_id,
            "content_chars": update.content.chars().count(),
        })))
    }
}

pub struct CampaignHandler;

#[async_trait]
impl Handler for CampaignHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::StartCampaign
    }

    async fn execute(&self, params: &TaskParams) -> Result<HandlerOutput, HandlerError> {
        let TaskParams::StartCampaign(open) = params else {
            return Err(wrong_params(self.kind(), params));
        };
        info!(campaign_id = open.get("campaign_id").unwrap_or("-"), "Starting campaign");
        Ok(output(json!({ "confirmation_code": "CAMPAIGN_STARTED" })))
    }
}

pub struct RefactorHandler;

#[async_trait]
impl Handler for RefactorHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::RefactorCode
    }

    async fn execute(&self, params: &TaskParams) -> Result<HandlerOutput, HandlerError> {
        let TaskParams::RefactorCode(open) = params else {
            return Err(wrong_params(self.kind(), params));
        };
        info!(target_path = open.get("target").unwrap_or("-"), "Refactoring code");
        Ok(output(json!({ "new_code_path": "/path/to/refactored/code.py" })))
    }
}

pub struct ProvisionHandler;

#[async_trait]
impl Handler for ProvisionHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::ProvisionInfra
    }

    async fn execute(&self, params: &TaskParams) -> Result<HandlerOutput, HandlerError> {
        let TaskParams::ProvisionInfra(open) = params else {
            return Err(wrong_params(self.kind(), params));
        };
        info!(service = open.get("service").unwrap_or("-"), "Provisioning infrastructure");
        Ok(output(json!({ "service_ip": "34.123.45.67" })))
    }
}

pub struct IntegrationStatusHandler;

#[async_trait]
impl Handler for IntegrationStatusHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::CheckIntegrationStatus
    }

    async fn execute(&self, params: &TaskParams) -> Result<HandlerOutput, HandlerError> {
        let TaskParams::CheckIntegrationStatus(open) = params else {
            return Err(wrong_params(self.kind(), params));
        };
        let service = required(self.kind(), open, "service")?;
        let status = if KNOWN_SERVICES.contains(&service) {
            "connected"
        } else {
            "unknown_service"
        };
        Ok(output(json!({ "status": status, "service": service })))
    }
}

pub struct RefreshTokenHandler;

#[async_trait]
impl Handler for RefreshTokenHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::RefreshToken
    }

    async fn execute(&self, params: &TaskParams) -> Result<HandlerOutput, HandlerError> {
        let TaskParams::RefreshToken(open) = params else {
            return Err(wrong_params(self.kind(), params));
        };
        let service = required(self.kind(), open, "service")?;
        info!(service, "Rotating token");
        Ok(output(json!({ "status": "token_refreshed", "service": service })))
    }
}

pub struct SyncAudienceHandler;

#[async_trait]
impl Handler for SyncAudienceHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::SyncAudience
    }

    async fn execute(&self, params: &TaskParams) -> Result<HandlerOutput, HandlerError> {
        let TaskParams::SyncAudience(open) = params else {
            return Err(wrong_params(self.kind(), params));
        };
        let audience_id = required(self.kind(), open, "audience_id")?;
        let destination = open.get("dest_platform").unwrap_or("meta");
        if destination != "meta" {
            return Err(HandlerError::Fatal(format!(
                "audience sync to '{destination}' is not supported"
            )));
        }
        info!(audience_id, destination, "Syncing audience");
        Ok(output(json!({ "status": "sync_triggered", "audience_id": audience_id })))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::domain::{ReportFormat, ScanSite};

    fn open(pairs: &[(&str, &str)]) -> OpenParams {
        OpenParams(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[tokio::test]
    async fn test_specialist_outputs() {
        let out = CampaignHandler
            .execute(&TaskParams::StartCampaign(open(&[("campaign_id", "c1")])))
            .await
            .unwrap();
        assert_eq!(out["confirmation_code"], "CAMPAIGN_STARTED");

        let out = ProvisionHandler
            .execute(&TaskParams::ProvisionInfra(OpenParams::default()))
            .await
            .unwrap();
        assert_eq!(out["service_ip"], "34.123.45.67");

        let out = RefactorHandler
            .execute(&TaskParams::RefactorCode(OpenParams::default()))
            .await
            .unwrap();
        assert!(out.contains_key("new_code_path"));
    }

    #[tokio::test]
    async fn test_integration_status() {
        let out = IntegrationStatusHandler
            .execute(&TaskParams::CheckIntegrationStatus(open(&[("service", "mailchimp")])))
            .await
            .unwrap();
        assert_eq!(out["status"], "connected");

        let out = IntegrationStatusHandler
            .execute(&TaskParams::CheckIntegrationStatus(open(&[("service", "fax")])))
            .await
            .unwrap();
        assert_eq!(out["status"], "unknown_service");

        let err = IntegrationStatusHandler
            .execute(&TaskParams::CheckIntegrationStatus(OpenParams::default()))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_refresh_and_sync() {
        let out = RefreshTokenHandler
            .execute(&TaskParams::RefreshToken(open(&[("service", "mailchimp")])))
            .await
            .unwrap();
        assert_eq!(out["status"], "token_refreshed");

        let out = SyncAudienceHandler
            .execute(&TaskParams::SyncAudience(open(&[("audience_id", "a1")])))
            .await
            .unwrap();
        assert_eq!(out["status"], "sync_triggered");

        let err = SyncAudienceHandler
            .execute(&TaskParams::SyncAudience(open(&[
                ("audience_id", "a1"),
                ("dest_platform", "tiktok"),
            ])))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_report_file_name() {
        let params = TaskParams::PublishReport(crate::domain::PublishReport {
            client: "acme".to_string(),
            dataset: "q3".to_string(),
            format: ReportFormat::Pdf,
        });
        let out = ReportHandler.execute(&params).await.unwrap();
        assert_eq!(out["report_file"], "acme_q3.pdf");
    }

    #[tokio::test]
    async fn test_wrong_params_rejected() {
        let params = TaskParams::ScanSite(ScanSite {
            domain: "example.com".to_string(),
        });
        let err = ReportHandler.execute(&params).await.unwrap_err();
        assert!(matches!(err, HandlerError::Fatal(_)));
    }
}
