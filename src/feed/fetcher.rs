//! HTTP fetching of feed payloads with retry and backoff.
//!
//! The transport is a trait seam so the retry policy can be exercised
//! without a network; the production implementation is a shared
//! `reqwest` client with a hard per-request timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::FeedDescriptor;

/// Responses larger than this are rejected before decode.
const MAX_FEED_BYTES: usize = 50 * 1024 * 1024;

/// First backoff step; doubles per attempt up to [`BACKOFF_CAP`].
const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(4);

/// Transport-level failure for one fetch attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("http status {0}")]
    Http(u16),
    #[error("name resolution or connect failure: {0}")]
    Dns(String),
    #[error("response exceeded {MAX_FEED_BYTES} bytes")]
    SizeLimit,
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Dns(_) => true,
            FetchError::Http(code) => *code >= 500,
            FetchError::SizeLimit => false,
        }
    }
}

/// Minimal async HTTP seam.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Production transport: shared reqwest client, rustls, hard timeout.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("subway-monitor/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedTransport for HttpTransport {
    async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await.map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http(status.as_u16()));
        }
        if let Some(len) = response.content_length() {
            if len as usize > MAX_FEED_BYTES {
                return Err(FetchError::SizeLimit);
            }
        }
        let body = response.bytes().await.map_err(classify)?;
        if body.len() > MAX_FEED_BYTES {
            return Err(FetchError::SizeLimit);
        }
        Ok(body.to_vec())
    }
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else if let Some(status) = err.status() {
        FetchError::Http(status.as_u16())
    } else {
        FetchError::Dns(err.to_string())
    }
}

/// Retrying fetcher for the ingest tick.
pub struct FeedFetcher {
    transport: Arc<dyn FeedTransport>,
    max_retries: u32,
}

impl FeedFetcher {
    pub fn new(transport: Arc<dyn FeedTransport>, max_retries: u32) -> Self {
        Self {
            transport,
            max_retries,
        }
    }

    /// Fetch one feed, retrying transient failures with exponential
    /// backoff and ±20% jitter. Returns the last error once retries are
    /// exhausted.
    pub async fn fetch(&self, feed: &FeedDescriptor) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0u32;
        loop {
            match self.transport.get(&feed.url).await {
                Ok(bytes) => {
                    debug!(feed_id = %feed.feed_id, bytes = bytes.len(), "feed fetched");
                    return Ok(bytes);
                }
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        feed_id = %feed.feed_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Exponential backoff with jitter: 250 ms doubling, capped at 4 s, ±20%.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE
        .checked_mul(1u32 << attempt.min(6))
        .unwrap_or(BACKOFF_CAP)
        .min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    base.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FlakyTransport {
        failures: Mutex<u32>,
        error: FetchError,
    }

    #[async_trait]
    impl FeedTransport for FlakyTransport {
        async fn get(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                Err(self.error.clone())
            } else {
                Ok(vec![1, 2, 3])
            }
        }
    }

    fn feed() -> FeedDescriptor {
        FeedDescriptor {
            feed_id: "ace".to_string(),
            url: "http://feeds.example/ace".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let fetcher = FeedFetcher::new(
            Arc::new(FlakyTransport {
                failures: Mutex::new(2),
                error: FetchError::Timeout,
            }),
            3,
        );
        let bytes = fetcher.fetch(&feed()).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_last_error() {
        let fetcher = FeedFetcher::new(
            Arc::new(FlakyTransport {
                failures: Mutex::new(10),
                error: FetchError::Timeout,
            }),
            3,
        );
        assert_eq!(fetcher.fetch(&feed()).await, Err(FetchError::Timeout));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let transport = Arc::new(FlakyTransport {
            failures: Mutex::new(5),
            error: FetchError::Http(404),
        });
        let fetcher = FeedFetcher::new(transport.clone(), 3);
        assert_eq!(fetcher.fetch(&feed()).await, Err(FetchError::Http(404)));
        // One attempt consumed, none retried.
        assert_eq!(*transport.failures.lock(), 4);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        for attempt in 0..8 {
            let d = backoff_delay(attempt);
            let nominal = Duration::from_millis(250 * (1 << attempt.min(6)) as u64)
                .min(Duration::from_secs(4));
            assert!(d >= nominal.mul_f64(0.79), "attempt {attempt}: {d:?}");
            assert!(d <= nominal.mul_f64(1.21), "attempt {attempt}: {d:?}");
        }
    }
}
