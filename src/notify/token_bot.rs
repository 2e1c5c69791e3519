use anyhow::{bail, Context, Result};
use metrics::counter;
use reqwest::Client;
use std::time::Duration;

use super::{unknown_status, ApiResponse, DispatchOutcome, Dispatcher, LinkPayload};

const PROCESS_PATH: &str = "/api/process";
const HEALTH_PATH: &str = "/health";

/// HTTP client for the link-processing API ("token bot").
#[derive(Clone)]
pub struct TokenBotClient {
    api_url: Option<String>,
    client: Client,
    timeout: Duration,
    max_retries: u8,
    retry_delay: Duration,
}

impl TokenBotClient {
    pub fn new(api_url: Option<String>) -> Self {
        Self {
            api_url: api_url.filter(|u| !u.trim().is_empty()),
            client: Client::new(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    /// Total attempts per submit; 0 is treated as 1.
    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn api_url(&self) -> Option<&str> {
        self.api_url.as_deref()
    }

    /// Health endpoint next to the processing endpoint.
    pub fn health_url(&self) -> Option<String> {
        self.api_url
            .as_deref()
            .map(|u| u.replace(PROCESS_PATH, HEALTH_PATH))
    }

    async fn attempt(&self, url: &str, payload: &LinkPayload) -> Result<ApiResponse> {
        let rsp = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .context("processing api request")?;

        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            bail!("processing api HTTP {status}: {snippet}");
        }

        let body = rsp.text().await.context("reading processing api body")?;
        // 2xx with an unreadable body still counts as delivered.
        Ok(serde_json::from_str(&body).unwrap_or_else(|_| ApiResponse {
            status: unknown_status(),
            message: None,
        }))
    }
}

#[async_trait::async_trait]
impl Dispatcher for TokenBotClient {
    async fn submit(&self, payload: &LinkPayload) -> DispatchOutcome {
        let Some(url) = self.api_url.as_deref() else {
            tracing::error!(target: "dispatch", "TOKEN_BOT_API_URL not configured");
            return DispatchOutcome::Failed;
        };

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            match self.attempt(url, payload).await {
                Ok(rsp) => {
                    tracing::info!(
                        target: "dispatch",
                        status = %rsp.status,
                        attempt,
                        message_id = payload.channel_info.message_id,
                        "api response"
                    );
                    return DispatchOutcome::from_response(rsp);
                }
                Err(e) => {
                    tracing::error!(target: "dispatch", attempt, error = ?e, "api call failed");
                    counter!("monitor_dispatch_attempt_errors_total").increment(1);
                }
            }

            if attempt >= self.max_retries {
                tracing::warn!(target: "dispatch", attempts = attempt, url = %payload.url, "giving up");
                return DispatchOutcome::Failed;
            }
            tracing::warn!(target: "dispatch", delay_ms = self.retry_delay.as_millis() as u64, "retrying");
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    async fn health_check(&self) -> bool {
        let Some(url) = self.health_url() else {
            return false;
        };
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(rsp) => rsp.status() == reqwest::StatusCode::OK,
            Err(e) => {
                tracing::error!(target: "dispatch", error = ?e, "health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_url_replaces_process_suffix() {
        let c = TokenBotClient::new(Some("https://bot.example/api/process".into()));
        assert_eq!(c.health_url().as_deref(), Some("https://bot.example/health"));
    }

    #[test]
    fn blank_url_counts_as_unconfigured() {
        let c = TokenBotClient::new(Some("   ".into()));
        assert!(c.api_url().is_none());
        assert!(c.health_url().is_none());
    }

    #[tokio::test]
    async fn unconfigured_submit_fails_fast() {
        let c = TokenBotClient::new(None);
        let payload = LinkPayload {
            url: "https://amzn.to/abc".into(),
            original_text: String::new(),
            images: vec![],
            channel_info: crate::notify::ChannelInfo {
                channel_id: 1,
                message_id: 1,
                channel_title: "t".into(),
            },
        };
        assert_eq!(c.submit(&payload).await, DispatchOutcome::Failed);
    }
}
