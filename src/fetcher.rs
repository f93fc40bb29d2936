//! Abstract fetch transport plus the reqwest-backed production
//! implementation with rate limiting, retries, and anti-bot throttling.

use crate::backoff::RetryPolicy;
use crate::config::{AuthConfig, AuthMode, CrawlConfig};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFor {
    DomContentLoaded,
    NetworkIdle,
}

#[derive(Debug, Clone)]
pub struct FetchStrategy {
    pub wait_for: WaitFor,
    pub timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for FetchStrategy {
    fn default() -> Self {
        Self {
            wait_for: WaitFor::DomContentLoaded,
            timeout: Duration::from_secs(20),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// A subresource captured while rendering a page, when a rendering driver
/// is available.
#[derive(Debug, Clone)]
pub struct Subresource {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub final_url: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// Rendered DOM text when a headless driver produced one; absent for
    /// plain HTTP fetches.
    pub rendered_html: Option<String>,
    pub subresources: Vec<Subresource>,
}

impl FetchResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("DNS resolution failed")]
    Dns,

    #[error("TLS negotiation failed")]
    Tls,

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by origin (429)")]
    RateLimited,

    #[error("HTTP status {0}")]
    Http(u16),

    #[error("response body too large: {0} bytes (cap {1})")]
    BodyTooLarge(usize, usize),

    #[error("anti-bot challenge detected")]
    AntiBot,

    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),
}

impl FetchError {
    /// Short kind label used for error counters and log events.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout => "fetch-timeout",
            FetchError::Dns => "fetch-dns",
            FetchError::Tls => "fetch-tls",
            FetchError::Network(_) => "fetch-network",
            FetchError::RateLimited => "fetch-rate-limited",
            FetchError::Http(status) if (400..500).contains(status) => "fetch-http-4xx",
            FetchError::Http(_) => "fetch-http-5xx",
            FetchError::BodyTooLarge(_, _) => "body-too-large",
            FetchError::AntiBot => "anti-bot",
            FetchError::ClientBuild(_) => "client-build",
        }
    }

    /// 401/403 responses: marked access-denied and never re-queued.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, FetchError::Http(401) | FetchError::Http(403))
    }

    fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return FetchError::Timeout;
        }

        let message = error.to_string().to_lowercase();
        if error.is_connect() {
            if message.contains("dns")
                || message.contains("name resolution")
                || message.contains("no such host")
            {
                return FetchError::Dns;
            }
        }
        if message.contains("certificate") || message.contains("ssl") || message.contains("tls") {
            return FetchError::Tls;
        }

        FetchError::Network(error.to_string())
    }
}

/// Transport contract consumed by the orchestrator. The production impl is
/// HTTP-only; a headless driver can plug in behind the same trait.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, strategy: &FetchStrategy)
        -> Result<FetchResponse, FetchError>;
}

/// Global request pacing: a token bucket refilled at `rate` requests/second.
struct TokenBucket {
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: 1.0,
                rate: rate.max(0.1),
                last_refill: Instant::now(),
            }),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                let rate = state.rate;
                state.tokens = (state.tokens + elapsed * rate).min(rate.max(1.0));
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - state.tokens) / rate))
                }
            };

            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    fn halve_rate(&self) {
        let mut state = self.state.lock();
        state.rate = (state.rate / 2.0).max(0.1);
    }

    fn rate(&self) -> f64 {
        self.state.lock().rate
    }
}

/// Reqwest-backed fetcher with a tuned connection pool, global token-bucket
/// pacing, bounded in-flight concurrency, and a retry loop.
pub struct HttpFetcher {
    client: Client,
    bucket: TokenBucket,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    max_retries: u32,
    auth: AuthConfig,
    throttled: AtomicBool,
}

impl HttpFetcher {
    pub fn from_config(config: &CrawlConfig) -> Result<Self, FetchError> {
        let redirects = if config.crawl.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };

        let client = Client::builder()
            .user_agent(format!("webrecon/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(config.crawl.timeout_ms))
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .redirect(redirects)
            .build()
            .map_err(|e| FetchError::ClientBuild(e.to_string()))?;

        Ok(Self {
            client,
            bucket: TokenBucket::new(config.crawl.rate_limit_rps),
            permits: Arc::new(Semaphore::new(config.crawl.concurrency)),
            retry: RetryPolicy::default(),
            max_retries: config.crawl.max_retries,
            auth: config.auth.clone(),
            throttled: AtomicBool::new(false),
        })
    }

    pub fn current_rate(&self) -> f64 {
        self.bucket.rate()
    }

    /// Halve the request rate for the remainder of the run. Applied once,
    /// on the first anti-bot sighting.
    fn throttle_for_anti_bot(&self) {
        if !self.throttled.swap(true, Ordering::SeqCst) {
            self.bucket.halve_rate();
            tracing::warn!(
                event = "anti-bot",
                new_rate_rps = self.bucket.rate(),
                "anti-bot challenge detected, halving request rate"
            );
        }
    }

    async fn attempt(
        &self,
        url: &str,
        strategy: &FetchStrategy,
    ) -> Result<FetchResponse, FetchError> {
        self.bucket.acquire().await;

        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Network("fetch permits closed".to_string()))?;

        let mut request = self
            .client
            .get(url)
            .timeout(strategy.timeout)
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/json;q=0.9,*/*;q=0.8",
            )
            .header("Accept-Language", "en-US,en;q=0.5");

        match self.auth.mode {
            AuthMode::Header => {
                if let (Some(name), Some(value)) =
                    (&self.auth.header_name, &self.auth.header_value)
                {
                    request = request.header(name.as_str(), value.as_str());
                }
            }
            AuthMode::Cookies => {
                if let Some(cookies) = &self.auth.cookies {
                    request = request.header("Cookie", cookies.as_str());
                }
            }
            AuthMode::None => {}
        }

        let response = request.send().await.map_err(FetchError::from_reqwest)?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();

        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), v.to_string());
            }
        }
        let content_type = headers.get("content-type").cloned();

        if let Some(length) = response.content_length() {
            if length as usize > strategy.max_body_bytes {
                return Err(FetchError::BodyTooLarge(
                    length as usize,
                    strategy.max_body_bytes,
                ));
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?
            .to_vec();

        if body.len() > strategy.max_body_bytes {
            return Err(FetchError::BodyTooLarge(body.len(), strategy.max_body_bytes));
        }

        if looks_like_anti_bot(status, &headers, &body) {
            self.throttle_for_anti_bot();
            return Err(FetchError::AntiBot);
        }

        if status == 429 {
            return Err(FetchError::RateLimited);
        }
        if status >= 400 {
            return Err(FetchError::Http(status));
        }

        Ok(FetchResponse {
            final_url,
            status,
            headers,
            content_type,
            body,
            rendered_html: None,
            subresources: Vec::new(),
        })
    }

    fn should_retry(&self, error: &FetchError, attempt: u32) -> bool {
        match error {
            FetchError::RateLimited | FetchError::Http(408) => attempt < self.max_retries,
            FetchError::Http(status) if *status >= 500 => attempt < self.max_retries,
            FetchError::Timeout | FetchError::Network(_) => attempt < self.max_retries,
            FetchError::Dns | FetchError::Tls => attempt == 0,
            _ => false,
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        strategy: &FetchStrategy,
    ) -> Result<FetchResponse, FetchError> {
        let mut attempt = 0u32;
        loop {
            match self.attempt(url, strategy).await {
                Ok(response) => {
                    tracing::debug!(
                        event = "fetch",
                        url,
                        status = response.status,
                        attempt,
                        "fetch succeeded"
                    );
                    return Ok(response);
                }
                Err(error) => {
                    tracing::debug!(
                        event = "fetch",
                        url,
                        error = %error,
                        attempt,
                        "fetch attempt failed"
                    );
                    if !self.should_retry(&error, attempt) {
                        return Err(error);
                    }
                    let delay = self.retry.delay(attempt);
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Heuristic challenge detection on status, headers, and body markers.
fn looks_like_anti_bot(status: u16, headers: &HashMap<String, String>, body: &[u8]) -> bool {
    if status != 403 && status != 503 {
        return false;
    }

    let server = headers.get("server").map(|s| s.to_ascii_lowercase());
    if matches!(&server, Some(s) if s.contains("cloudflare")) && status == 403 {
        return true;
    }

    let head = &body[..body.len().min(4096)];
    let text = String::from_utf8_lossy(head).to_lowercase();
    text.contains("captcha")
        || text.contains("cf-chl")
        || text.contains("challenge-platform")
        || text.contains("attention required")
}
