//! Cluster monitoring. Scrapes each cluster's Prometheus for firing alerts,
//! forwards the real ones to the control plane and gives every driver a
//! periodic housekeeping slot.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use api_client::ApiClient;
use drivers::{ClusterConfig, DriverRegistry};
use models::Alert;

use crate::{ControllerError, Pacing};

const ALERT_SOURCE: &str = "prometheus";

const SCRAPE_TIMEOUT: Duration = Duration::from_secs(5);

/// Scrapes run at most once a minute no matter how the polling window is
/// configured.
const SCRAPE_FLOOR_SECS: u64 = 60;

#[derive(Deserialize)]
struct AlertsResponse {
    data: AlertsData,
}

#[derive(Deserialize)]
struct AlertsData {
    #[serde(default)]
    alerts: Vec<Value>,
}

pub struct ClusterController {
    client: Arc<ApiClient>,
    registry: Arc<DriverRegistry>,
    http: reqwest::Client,
    pacing: Pacing,
}

impl ClusterController {
    pub fn new(
        client: Arc<ApiClient>,
        registry: Arc<DriverRegistry>,
    ) -> Result<Self, ControllerError> {
        let http = reqwest::Client::builder()
            .timeout(SCRAPE_TIMEOUT)
            .connect_timeout(SCRAPE_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            registry,
            http,
            pacing: Pacing::from_env("CLUSTER_CONTROLLER", 30, 90),
        })
    }

    pub async fn process(&mut self) -> Result<(), ControllerError> {
        if !self.pacing.due() {
            return Ok(());
        }
        self.pacing.schedule_next_with_floor(SCRAPE_FLOOR_SECS);

        let clusters = self.registry.clusters().clusters.clone();
        for cluster in &clusters {
            if cluster.disable_alerts {
                debug!(cluster = %cluster.name, "alerts disabled");
                continue;
            }
            let Some(app_domain) = cluster.app_domain.as_deref() else {
                continue;
            };
            if let Err(err) = self.scrape_alerts(cluster, app_domain).await {
                warn!(cluster = %cluster.name, error = %err, "alert scrape failed");
            }
        }

        // a failing driver must not cost the other clusters their slot
        for cluster in &clusters {
            match self.registry.driver_for(&cluster.name).await {
                Ok(driver) => {
                    if let Err(err) = driver.housekeep().await {
                        warn!(cluster = %cluster.name, error = %err, "housekeeping failed");
                    }
                }
                Err(err) => {
                    warn!(cluster = %cluster.name, error = %err, "no driver for housekeeping");
                }
            }
        }
        Ok(())
    }

    async fn scrape_alerts(
        &self,
        cluster: &ClusterConfig,
        app_domain: &str,
    ) -> Result<(), ControllerError> {
        let url = format!("https://{app_domain}/prometheus/api/v1/alerts");
        let resp = self
            .http
            .get(&url)
            .basic_auth("token", cluster.monitoring_token.as_deref())
            .send()
            .await?;
        if !resp.status().is_success() {
            warn!(cluster = %cluster.name, status = %resp.status(), "alert endpoint error");
            return Ok(());
        }

        let body: AlertsResponse = resp.json().await?;
        if body.data.alerts.is_empty() {
            // the watchdog alert should always fire, so this means broken
            warn!(cluster = %cluster.name, "zero alerts, monitoring looks broken");
            return Ok(());
        }

        let ignored = ignored_alert_names();
        let real: Vec<&Value> = body
            .data
            .alerts
            .iter()
            .filter(|alert| is_real_alert(alert, &ignored))
            .collect();

        if real.is_empty() {
            debug!(cluster = %cluster.name, "only watchdog level alerts, resetting");
            self.client.reset_alerts(&cluster.name, ALERT_SOURCE).await?;
            return Ok(());
        }

        let mut batch: Vec<Alert> = real
            .into_iter()
            .map(|alert| Alert::firing(&cluster.name, ALERT_SOURCE, alert.clone()))
            .collect();
        warn!(cluster = %cluster.name, count = batch.len(), "firing alerts found");
        batch.push(Alert::ok(&cluster.name, ALERT_SOURCE));
        self.client.post_alerts(&batch).await?;
        Ok(())
    }
}

/// Comma-separated alert names in `ALERTNAMES_TO_IGNORE` are dropped before
/// reporting.
fn ignored_alert_names() -> Vec<String> {
    std::env::var("ALERTNAMES_TO_IGNORE")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Real alerts are firing with a severity above `info`, minus the ignore
/// list. Everything else is watchdog noise.
fn is_real_alert(alert: &Value, ignored: &[String]) -> bool {
    let severity = alert["labels"]["severity"].as_str().unwrap_or("none");
    if severity == "none" || severity == "info" {
        return false;
    }
    if alert["state"].as_str() != Some("firing") {
        return false;
    }
    let name = alert["labels"]["alertname"].as_str().unwrap_or_default();
    !ignored.iter().any(|ignored_name| ignored_name == name)
}
