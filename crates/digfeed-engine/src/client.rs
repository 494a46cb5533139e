//! Throttled HTTP client.
//!
//! Every request through a `RateLimitedClient` (and its clones) passes a
//! shared gate that keeps dispatches at least `min_interval` apart. The
//! client maps HTTP failures onto `FeedError` but never retries; callers wrap
//! it in a `RetryPolicy`.

use crate::error::{FeedError, Result};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

const REQUEST_TIMEOUT_SECS: u64 = 20;

/// Minimum-interval gate.
#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    last_dispatch: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_dispatch: Mutex::new(None),
        }
    }

    /// Wait until a dispatch slot is free and claim it.
    ///
    /// The lock is held across the sleep so concurrent callers queue up and
    /// each gets its own slot.
    pub async fn acquire(&self) {
        let mut last = self.last_dispatch.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitedClient {
    http: Client,
    throttle: Arc<Throttle>,
    auth_header: Option<String>,
}

impl RateLimitedClient {
    pub fn new(user_agent: &str, min_interval: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| FeedError::Transient(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            throttle: Arc::new(Throttle::new(min_interval)),
            auth_header: None,
        })
    }

    /// Send `value` as the `Authorization` header on every request.
    pub fn with_authorization(mut self, value: impl Into<String>) -> Self {
        self.auth_header = Some(value.into());
        self
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = self.dispatch(self.http.get(url).query(query)).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| FeedError::Decode(format!("{}: {}", url, e)))
    }

    pub async fn get_text(&self, url: &str, query: &[(&str, String)]) -> Result<String> {
        let response = self.dispatch(self.http.get(url).query(query)).await?;
        Ok(response.text().await?)
    }

    async fn dispatch(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let request = match &self.auth_header {
            Some(value) => request.header(reqwest::header::AUTHORIZATION, value),
            None => request,
        };

        self.throttle.acquire().await;
        let response = request.send().await?;
        let status = response.status();
        debug!("[http] {} {}", status.as_u16(), response.url());

        if status.is_success() {
            return Ok(response);
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after, &body))
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a non-success status onto the error taxonomy.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> FeedError {
    match status {
        StatusCode::NOT_FOUND => FeedError::NotFound(snippet(body)),
        StatusCode::TOO_MANY_REQUESTS => FeedError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED => FeedError::Auth(snippet(body)),
        StatusCode::FORBIDDEN => {
            let lower = body.to_ascii_lowercase();
            if lower.contains("quota") || lower.contains("ratelimitexceeded") {
                FeedError::QuotaExceeded(snippet(body))
            } else {
                FeedError::Auth(snippet(body))
            }
        }
        s if s.is_server_error() => FeedError::Transient(format!("server error {}", s.as_u16())),
        s => FeedError::Rejected { status: s.as_u16() },
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}
