//! Async HTTP client with a user agent, per-request timeout and retries with exponential backoff.

use crate::mindtouch::error::FetchError;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_USER_AGENT: &str =
    "mindtouch-zim/0.1 (+https://www.kiwix.org) reqwest";
const DEFAULT_TIMEOUT_SECS: u64 = 15;
const MAX_REDIRECTS: usize = 10;

/// Default number of attempts for get_with_retry (initial plus retries).
pub const DEFAULT_RETRY_COUNT: u32 = 5;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
/// HTTP 429 waits longer so the server can recover.
const RATE_LIMIT_FACTOR: u32 = 4;

/// Body and declared content type of a successful GET.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Fetched {
    /// Content type without parameters, lowercased (e.g. `image/png`).
    pub fn mime_type(&self) -> Option<String> {
        self.content_type.as_deref().map(|ct| {
            ct.split(';')
                .next()
                .unwrap_or(ct)
                .trim()
                .to_ascii_lowercase()
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// HTTP client shared by every stage. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PoliteClient {
    inner: reqwest::Client,
    retry_count: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl PoliteClient {
    /// Build a client with default User-Agent, timeout and retry policy.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::builder().build()
    }

    pub fn builder() -> PoliteClientBuilder {
        PoliteClientBuilder::default()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// GET `url` and read the whole body, retrying transient failures.
    ///
    /// Retries on timeout, connection errors, HTTP 5xx and 429 with exponential
    /// backoff plus jitter, for at most `retry_count` attempts in total. A transient
    /// failure on the last attempt is returned as [FetchError::Exhausted]; permanent
    /// failures (other 4xx) are returned immediately.
    pub async fn get_with_retry(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<Fetched, FetchError> {
        self.get_with_attempts(url, headers, self.retry_count).await
    }

    /// Like [PoliteClient::get_with_retry] with its own attempt limit (at least one).
    pub async fn get_with_attempts(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        max_attempts: u32,
    ) -> Result<Fetched, FetchError> {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.get_once(url, headers).await {
                Ok(fetched) => return Ok(fetched),
                Err(e) if e.is_transient() => {
                    if attempt >= max_attempts {
                        warn!(url, attempts = attempt, error = %e, "giving up");
                        return Err(FetchError::Exhausted {
                            url: url.to_string(),
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }
                    let delay = self.backoff(attempt, e.status() == Some(429));
                    debug!(url, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once(&self, url: &str, headers: &[(&str, &str)]) -> Result<Fetched, FetchError> {
        let mut request = self.inner.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = request.send().await.map_err(|e| FetchError::Network {
            url: url.to_string(),
            source: e,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.bytes().await.map_err(|e| FetchError::BodyRead {
            url: url.to_string(),
            source: e,
        })?;
        Ok(Fetched {
            url: url.to_string(),
            content_type,
            body: body.to_vec(),
        })
    }

    /// Delay before the attempt following `attempt` (1-based): base * 2^(attempt-1), capped, plus jitter.
    fn backoff(&self, attempt: u32, rate_limited: bool) -> Duration {
        let exp = self
            .backoff_base
            .saturating_mul(1u32 << (attempt - 1).min(16));
        let mut delay = exp.min(self.backoff_max);
        if rate_limited {
            delay = delay.saturating_mul(RATE_LIMIT_FACTOR).min(self.backoff_max);
        }
        let jitter_cap = delay.as_millis() as u64 / 4;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        delay + Duration::from_millis(jitter)
    }
}

/// Builder for PoliteClient with optional User-Agent, timeout, and retry settings.
#[derive(Debug)]
pub struct PoliteClientBuilder {
    user_agent: Option<String>,
    timeout: Duration,
    retry_count: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl Default for PoliteClientBuilder {
    fn default() -> Self {
        Self {
            user_agent: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retry_count: DEFAULT_RETRY_COUNT,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl PoliteClientBuilder {
    /// Set a custom User-Agent.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Per-request timeout. Default 15 s.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Total attempts for transient failures (at least 1). Default 5.
    pub fn retry_count(mut self, n: u32) -> Self {
        self.retry_count = n.max(1);
        self
    }

    /// First retry delay; doubled on every further attempt up to `max`.
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max.max(base);
        self
    }

    pub fn build(self) -> Result<PoliteClient, reqwest::Error> {
        let user_agent = self
            .user_agent
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let inner = reqwest::Client::builder()
            .cookie_store(true)
            .user_agent(user_agent)
            .timeout(self.timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(PoliteClient {
            inner,
            retry_count: self.retry_count,
            backoff_base: self.backoff_base,
            backoff_max: self.backoff_max,
        })
    }
}
