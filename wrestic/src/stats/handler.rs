use super::{PrometheusProvider, StatsHandler, WebhookProvider, encode_text};
use crate::error::{ResticError, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

const PUSH_JOB: &str = "restic_backup";

/// Sends stats over HTTP. Either sink is skipped when its URL is empty.
#[derive(Debug, Clone)]
pub struct Handler {
    client: reqwest::Client,
    prom_url: String,
    prom_hostname: String,
    webhook_url: String,
}

impl Handler {
    pub fn new(prom_url: &str, prom_hostname: &str, webhook_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            prom_url: prom_url.trim_end_matches('/').to_string(),
            prom_hostname: prom_hostname.to_string(),
            webhook_url: webhook_url.to_string(),
        }
    }

    /// Grouping key of the push gateway, metrics replace older ones of the same instance.
    pub fn push_url(&self) -> String {
        format!(
            "{}/metrics/job/{PUSH_JOB}/instance/{}",
            self.prom_url, self.prom_hostname
        )
    }
}

#[async_trait]
impl StatsHandler for Handler {
    async fn send_prometheus(&self, stats: &dyn PrometheusProvider) -> Result<()> {
        if self.prom_url.is_empty() {
            return Ok(());
        }
        let gauges = stats.to_prom();
        if gauges.is_empty() {
            return Ok(());
        }

        let (body, content_type) = encode_text(&gauges)?;
        let url = self.push_url();
        tracing::info!(url = %url, "sending prometheus stats");
        self.client
            .post(&url)
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn send_webhook(&self, stats: &dyn WebhookProvider) -> Result<()> {
        if self.webhook_url.is_empty() {
            return Ok(());
        }

        tracing::info!(url = %self.webhook_url, "sending webhooks");
        let data = stats
            .to_json()
            .map_err(|e| ResticError::decode("webhook payload", e))?;
        if data.is_empty() {
            return Err(ResticError::Io(std::io::Error::other("webhook data is empty")));
        }

        self.client
            .post(&self.webhook_url)
            .header(CONTENT_TYPE, "application/json")
            .body(data)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{Gauge, RestoreStats};

    #[test]
    fn test_push_url() {
        let handler = Handler::new("http://pushgateway:9091/", "ns", "");
        assert_eq!(
            handler.push_url(),
            "http://pushgateway:9091/metrics/job/restic_backup/instance/ns"
        );
    }

    #[tokio::test]
    async fn test_empty_urls_are_noops() {
        let handler = Handler::new("", "ns", "");
        handler
            .send_prometheus(&vec![Gauge::available_snapshots(1)])
            .await
            .unwrap();
        handler
            .send_webhook(&RestoreStats::default())
            .await
            .unwrap();
    }
}
