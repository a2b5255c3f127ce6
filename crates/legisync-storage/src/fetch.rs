//! Rate-limited HTTP access for scraping adapters.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn, Instrument};

/// Exponential delay between attempts, capped at `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: usize,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            first_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn delay_before_retry(&self, retry: usize) -> Duration {
        let doublings = u32::try_from(retry).unwrap_or(u32::MAX).min(31);
        self.first_delay
            .saturating_mul(1u32 << doublings)
            .min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests in flight across all adapters sharing the fetcher.
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 2,
            retry: RetryPolicy::default(),
        }
    }
}

/// Body of a successful page fetch.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub body: Vec<u8>,
}

impl FetchedPage {
    /// Legislature pages occasionally carry stray Latin-1 bytes.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}")]
    Status { status: u16, url: String },
    #[error("fetcher is shut down")]
    Closed,
}

impl FetchError {
    /// Throttling, server errors and dropped connections are worth another try.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            FetchError::Status { status, .. } => StatusCode::from_u16(*status)
                .map(|s| s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS)
                .unwrap_or(false),
            FetchError::Closed => false,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        if let Some(agent) = config.user_agent {
            builder = builder.user_agent(agent);
        }

        Ok(Self {
            client: builder.build().context("building http client")?,
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            retry: config.retry,
        })
    }

    /// GETs `url`, retrying transient failures up to the policy's limit.
    pub async fn fetch_page(&self, source_id: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let _permit = self.permits.acquire().await.map_err(|_| FetchError::Closed)?;
        let span = tracing::info_span!("http_fetch", source_id, url);
        async {
            let mut retry = 0usize;
            loop {
                match self.get_once(url).await {
                    Ok(page) => {
                        debug!(bytes = page.body.len(), "page fetched");
                        return Ok(page);
                    }
                    Err(err) if err.is_transient() && retry < self.retry.retries => {
                        let delay = self.retry.delay_before_retry(retry);
                        warn!(error = %err, retry, ?delay, "transient fetch failure");
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn get_once(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let transport = |source: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            source,
        };
        let resp = self.client.get(url).send().await.map_err(transport)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await.map_err(transport)?.to_vec();
        Ok(FetchedPage {
            url: final_url,
            body,
        })
    }
}
