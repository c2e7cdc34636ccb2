use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use qc_proto::{
    schema::CheckSubmission, AlertConfig, ChecklistResult, DetectionLog, DetectionRules,
    DetectionSource,
};
use qc_vision::{check_legacy, check_vision, map_detections, LabelMatch};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::RecordStore;

/// Fire on failures, or on every verdict when `on_fail_only` is off.
pub fn should_alert(cfg: &AlertConfig, pass: bool) -> bool {
    cfg.enabled && (!pass || !cfg.on_fail_only)
}

/// Payload posted to alert webhooks.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub station_id: Uuid,
    pub log_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub pass: bool,
    pub missing: Vec<String>,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, cfg: &AlertConfig, alert: &Alert) -> anyhow::Result<()>;
}

/// Posts alerts to the configured webhook. Email addresses are only logged;
/// mail delivery belongs to the notification service.
pub struct AlertDispatcher {
    client: reqwest::Client,
}

impl AlertDispatcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("build alert client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AlertSink for AlertDispatcher {
    async fn send(&self, cfg: &AlertConfig, alert: &Alert) -> anyhow::Result<()> {
        if let Some(email) = &cfg.email {
            info!(
                station_id = %alert.station_id,
                email = %email,
                pass = alert.pass,
                "email alert requested"
            );
        }
        if let Some(url) = &cfg.webhook_url {
            let resp = self.client.post(url).json(alert).send().await?;
            anyhow::ensure!(resp.status().is_success(), "webhook returned {}", resp.status());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub log: DetectionLog,
    pub alerted: bool,
}

pub struct StationChecker {
    records: Arc<dyn RecordStore>,
    alerts: Option<Arc<dyn AlertSink>>,
    label_match: LabelMatch,
}

impl StationChecker {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self {
            records,
            alerts: None,
            label_match: LabelMatch::default(),
        }
    }

    pub fn with_alerts(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(sink);
        self
    }

    pub fn with_label_match(mut self, strategy: LabelMatch) -> Self {
        self.label_match = strategy;
        self
    }

    pub async fn rules(&self, station_id: Uuid) -> Result<DetectionRules> {
        self.records
            .get_rules(station_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("detection rules for station {}", station_id)))
    }

    pub async fn put_rules(&self, rules: DetectionRules) -> Result<DetectionRules> {
        self.records.put_rules(rules.clone()).await?;
        info!(
            station_id = %rules.station_id,
            items = rules.expected_items.len(),
            "detection rules replaced"
        );
        Ok(rules)
    }

    /// Logged verdicts for the station, oldest first.
    pub async fn logs(&self, station_id: Uuid) -> Result<Vec<DetectionLog>> {
        Ok(self.records.list_logs(station_id).await?)
    }

    /// Pure reconciliation against `rules`; vision labels are mapped first.
    pub fn evaluate(
        &self,
        rules: &DetectionRules,
        submission: CheckSubmission,
    ) -> (ChecklistResult, DetectionSource) {
        let threshold = rules.confidence_threshold;
        match submission {
            CheckSubmission::Vision(objects) => {
                let mapped = map_detections(objects, &rules.expected_items, self.label_match);
                let result = check_vision(&rules.expected_items, &mapped, threshold);
                (result, DetectionSource::Vision)
            }
            CheckSubmission::Legacy(objects) => {
                let result = check_legacy(&rules.expected_items, &objects, threshold);
                (result, DetectionSource::Legacy)
            }
        }
    }

    pub async fn check(
        &self,
        station_id: Uuid,
        submission: CheckSubmission,
    ) -> Result<CheckOutcome> {
        let rules = self.rules(station_id).await?;
        let (result, source) = self.evaluate(&rules, submission);

        let log = DetectionLog {
            id: Uuid::new_v4(),
            station_id,
            timestamp: OffsetDateTime::now_utc(),
            result,
            source,
        };
        self.records.insert_log(log.clone()).await?;
        info!(
            station_id = %station_id,
            pass = log.result.pass,
            found = log.result.found.len(),
            missing = log.result.missing.len(),
            "station check"
        );

        let alerted = match (&rules.alert_config, &self.alerts) {
            (Some(cfg), Some(sink)) if should_alert(cfg, log.result.pass) => {
                let alert = Alert {
                    station_id,
                    log_id: log.id,
                    timestamp: log.timestamp,
                    pass: log.result.pass,
                    missing: log.result.missing.clone(),
                };
                match sink.send(cfg, &alert).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(station_id = %station_id, error = %e, "alert delivery failed");
                        false
                    }
                }
            }
            _ => false,
        };
        Ok(CheckOutcome { log, alerted })
    }
}
