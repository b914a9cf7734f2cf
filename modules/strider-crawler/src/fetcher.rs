//! Transport layer. The orchestrator only sees the `Fetch` trait; rate
//! limiting, concurrency caps, body limits, retries and the anti-bot
//! slowdown all live behind it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use browserless_client::{BrowserlessClient, ContentOptions, WaitUntil};
use strider_common::config::{AuthConfig, AuthMode, CrawlConfig, FetcherConfig};

const USER_AGENT: &str = "Mozilla/5.0 (compatible; strider/0.1)";

/// Base backoff for retryable failures. Actual delay is base * 2^attempt
/// plus jitter, capped at 30s.
const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_CAP: Duration = Duration::from_secs(30);

/// Floor for the token bucket refill rate after anti-bot throttling.
const MIN_RPS: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFor {
    DomContentLoaded,
    NetworkIdle,
}

#[derive(Debug, Clone, Copy)]
pub struct FetchStrategy {
    pub wait_for: WaitFor,
    pub timeout_ms: u64,
}

/// A resource captured alongside a rendered page.
#[derive(Debug, Clone)]
pub struct Subresource {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// URL after redirects.
    pub final_url: String,
    pub status: u16,
    /// Lowercased header names; first value wins on repeats.
    pub headers: HashMap<String, String>,
    pub content_type: Option<String>,
    pub body: Bytes,
    /// Rendered DOM when a browser-backed fetcher handled the page.
    pub rendered_html: Option<String>,
    pub subresources: Vec<Subresource>,
}

impl FetchResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("fetch timed out")]
    Timeout,

    #[error("dns resolution failed: {0}")]
    Dns(String),

    #[error("tls handshake failed: {0}")]
    Tls(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("http status {status}")]
    Http { status: u16 },

    #[error("rate limited by target")]
    RateLimited,

    #[error("body exceeds {limit} bytes")]
    BodyTooLarge { limit: u64 },

    #[error("anti-bot challenge detected")]
    AntiBot,
}

impl FetchError {
    /// Tally key for the manifest error table.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout => "timeout",
            FetchError::Dns(_) => "dns",
            FetchError::Tls(_) => "tls",
            FetchError::Network(_) => "network",
            FetchError::Http { status } if *status == 401 || *status == 403 => "access-denied",
            FetchError::Http { status } if *status >= 500 => "http-5xx",
            FetchError::Http { .. } => "http-4xx",
            FetchError::RateLimited => "rate-limited",
            FetchError::BodyTooLarge { .. } => "body-too-large",
            FetchError::AntiBot => "anti-bot",
        }
    }
}

#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str, strategy: &FetchStrategy) -> Result<FetchResponse, FetchError>;
}

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

struct BucketState {
    tokens: f64,
    rate: f64,
    last_refill: tokio::time::Instant,
}

/// Global request-per-second limiter shared by all in-flight fetches.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
}

impl TokenBucket {
    pub fn new(rate: f64) -> Self {
        let capacity = rate.max(1.0);
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                rate,
                last_refill: tokio::time::Instant::now(),
            }),
            capacity,
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = tokio::time::Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * state.rate).min(self.capacity);
                state.last_refill = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / state.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Halve the refill rate for the remainder of the run.
    pub async fn slow_down(&self) -> f64 {
        let mut state = self.state.lock().await;
        state.rate = (state.rate / 2.0).max(MIN_RPS);
        state.rate
    }
}

// ---------------------------------------------------------------------------
// HTTP fetcher
// ---------------------------------------------------------------------------

pub struct HttpFetcher {
    client: reqwest::Client,
    bucket: TokenBucket,
    semaphore: Semaphore,
    max_retries: u32,
    caps: BodyCaps,
    auth_header: Option<(&'static str, String)>,
    custom_header: Option<(String, String)>,
    throttled: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
struct BodyCaps {
    html: u64,
    js: u64,
    api: u64,
}

impl BodyCaps {
    fn for_content_type(&self, content_type: Option<&str>) -> u64 {
        match content_type {
            Some(ct) if ct.contains("javascript") => self.js,
            Some(ct) if ct.contains("json") => self.api,
            _ => self.html,
        }
    }
}

impl HttpFetcher {
    pub fn new(
        crawl: &CrawlConfig,
        fetcher: &FetcherConfig,
        auth: &AuthConfig,
    ) -> anyhow::Result<Self> {
        let redirect = if crawl.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(redirect)
            .timeout(Duration::from_millis(crawl.timeout_ms))
            .build()?;

        let (auth_header, custom_header) = match auth.mode {
            AuthMode::None => (None, None),
            AuthMode::Cookies => (Some(("cookie", auth.value.clone())), None),
            AuthMode::Header => (None, Some((auth.header_name.clone(), auth.value.clone()))),
        };

        Ok(Self {
            client,
            bucket: TokenBucket::new(crawl.rate_limit_rps),
            semaphore: Semaphore::new(crawl.concurrency),
            max_retries: fetcher.max_retries,
            caps: BodyCaps {
                html: fetcher.max_body_bytes_html,
                js: fetcher.max_body_bytes_js,
                api: fetcher.max_body_bytes_api,
            },
            auth_header,
            custom_header,
            throttled: AtomicBool::new(false),
        })
    }

    async fn attempt(
        &self,
        url: &str,
        strategy: &FetchStrategy,
    ) -> Result<FetchResponse, FetchError> {
        let mut request = self
            .client
            .get(url)
            .timeout(Duration::from_millis(strategy.timeout_ms));
        if let Some((name, value)) = &self.auth_header {
            request = request.header(*name, value.as_str());
        }
        if let Some((name, value)) = &self.custom_header {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(classify_transport)?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_lowercase(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let content_type = headers.get("content-type").cloned();

        let cap = self.caps.for_content_type(content_type.as_deref());
        if let Some(length) = response.content_length() {
            if length > cap {
                return Err(FetchError::BodyTooLarge { limit: cap });
            }
        }
        let body = response.bytes().await.map_err(classify_transport)?;
        if body.len() as u64 > cap {
            return Err(FetchError::BodyTooLarge { limit: cap });
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

    /// Record an anti-bot sighting: halve the refill rate, once per run.
    async fn note_anti_bot(&self, url: &str) {
        if !self.throttled.swap(true, Ordering::Relaxed) {
            let rate = self.bucket.slow_down().await;
            warn!(url, new_rps = rate, "Anti-bot challenge detected, throttling");
        }
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str, strategy: &FetchStrategy) -> Result<FetchResponse, FetchError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| FetchError::Network("fetcher shut down".to_string()))?;

        let mut transient_retried = false;
        let mut attempt = 0u32;
        loop {
            self.bucket.acquire().await;
            debug!(url, attempt, "fetch");

            match self.attempt(url, strategy).await {
                Ok(response) => {
                    if looks_like_anti_bot(response.status, &response.headers, &response.body) {
                        self.note_anti_bot(url).await;
                        return Err(FetchError::AntiBot);
                    }
                    match response.status {
                        429 | 408 => {
                            if attempt < self.max_retries {
                                backoff(attempt).await;
                                attempt += 1;
                                continue;
                            }
                            return Err(if response.status == 429 {
                                FetchError::RateLimited
                            } else {
                                FetchError::Http { status: 408 }
                            });
                        }
                        500..=599 => {
                            if attempt < self.max_retries {
                                backoff(attempt).await;
                                attempt += 1;
                                continue;
                            }
                            return Err(FetchError::Http {
                                status: response.status,
                            });
                        }
                        400..=499 => {
                            return Err(FetchError::Http {
                                status: response.status,
                            })
                        }
                        _ => return Ok(response),
                    }
                }
                Err(err) => {
                    let transient = matches!(
                        err,
                        FetchError::Dns(_)
                            | FetchError::Tls(_)
                            | FetchError::Network(_)
                            | FetchError::Timeout
                    );
                    if transient && !transient_retried {
                        transient_retried = true;
                        backoff(attempt).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

async fn backoff(attempt: u32) {
    let exp = RETRY_BASE * 2u32.pow(attempt.min(6));
    let jitter = Duration::from_millis(rand::rng().random_range(0..250));
    tokio::time::sleep((exp + jitter).min(RETRY_CAP)).await;
}

fn classify_transport(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout;
    }
    let detail = format!("{err:?}").to_lowercase();
    if detail.contains("dns") {
        FetchError::Dns(err.to_string())
    } else if detail.contains("certificate") || detail.contains("tls") || detail.contains("ssl") {
        FetchError::Tls(err.to_string())
    } else {
        FetchError::Network(err.to_string())
    }
}

/// Heuristic challenge detection on headers and a body preview.
fn looks_like_anti_bot(status: u16, headers: &HashMap<String, String>, body: &[u8]) -> bool {
    if (status == 403 || status == 503) && headers.contains_key("cf-ray") {
        return true;
    }
    if status == 403
        && headers
            .get("server")
            .map(|s| s.to_lowercase().contains("cloudflare"))
            .unwrap_or(false)
    {
        return true;
    }

    let preview = String::from_utf8_lossy(&body[..body.len().min(2048)]).to_lowercase();
    const MARKERS: &[&str] = &[
        "cf-browser-verification",
        "challenge-platform",
        "just a moment...",
        "verify you are human",
        "attention required! | cloudflare",
    ];
    MARKERS.iter().any(|m| preview.contains(m))
}

// ---------------------------------------------------------------------------
// Browserless-backed fetcher
// ---------------------------------------------------------------------------

/// Fetches over plain HTTP, then renders HTML pages through a Browserless
/// instance so the processor sees the settled DOM.
pub struct BrowserlessFetcher {
    http: HttpFetcher,
    client: BrowserlessClient,
}

impl BrowserlessFetcher {
    pub fn new(
        crawl: &CrawlConfig,
        fetcher: &FetcherConfig,
        auth: &AuthConfig,
    ) -> anyhow::Result<Self> {
        let token = if fetcher.browserless_token.is_empty() {
            None
        } else {
            Some(fetcher.browserless_token.as_str())
        };
        Ok(Self {
            http: HttpFetcher::new(crawl, fetcher, auth)?,
            client: BrowserlessClient::new(&fetcher.browserless_url, token)?,
        })
    }
}

#[async_trait]
impl Fetch for BrowserlessFetcher {
    async fn fetch(&self, url: &str, strategy: &FetchStrategy) -> Result<FetchResponse, FetchError> {
        let mut response = self.http.fetch(url, strategy).await?;

        let is_html = response
            .content_type
            .as_deref()
            .map(|ct| ct.contains("text/html"))
            .unwrap_or(false);
        if is_html {
            let options = ContentOptions {
                wait_until: match strategy.wait_for {
                    WaitFor::DomContentLoaded => WaitUntil::DomContentLoaded,
                    WaitFor::NetworkIdle => WaitUntil::NetworkIdle,
                },
                timeout_ms: strategy.timeout_ms,
            };
            match self.client.content(url, options).await {
                Ok(html) => response.rendered_html = Some(html),
                Err(e) => {
                    warn!(url, error = %e, "Browserless render failed, using raw body")
                }
            }
        }

        Ok(response)
    }
}
