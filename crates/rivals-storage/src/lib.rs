//! Outbound API plumbing (sliding-window admission, retrying GraphQL executor,
//! pagination) plus the local relational store.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, debug_span, warn, Instrument};

mod store;

pub use reqwest::StatusCode;
pub use store::{placeholder_email, EntityCounts, NewUser, Store, StoreError};

pub const CRATE_NAME: &str = "rivals-storage";

pub const DEFAULT_ENDPOINT: &str = "https://api.start.gg/gql/alpha";

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window: Duration,
    pub safety_margin: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 80,
            window: Duration::from_secs(60),
            safety_margin: Duration::from_secs(1),
        }
    }
}

/// Process-wide sliding-window admission control.
///
/// One instance is shared by every importer using the same API credential set;
/// the quota belongs to the credential, not to the call site. Timing uses the
/// tokio clock so tests can run it under a paused runtime.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    log: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            log: Mutex::new(VecDeque::with_capacity(config.max_requests)),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Waits until one more request fits in the trailing window, then records it.
    pub async fn admit(&self) {
        let capacity = self.config.max_requests.max(1);
        loop {
            let mut log = self.log.lock().await;
            let now = Instant::now();
            while let Some(oldest) = log.front() {
                if now.duration_since(*oldest) >= self.config.window {
                    log.pop_front();
                } else {
                    break;
                }
            }

            let oldest = match log.front() {
                Some(oldest) if log.len() >= capacity => *oldest,
                _ => {
                    log.push_back(now);
                    return;
                }
            };

            let wake_at = oldest + self.config.window + self.config.safety_margin;
            drop(log);
            debug!(
                wait_ms = wake_at.saturating_duration_since(now).as_millis() as u64,
                "rate limit window full; waiting"
            );
            tokio::time::sleep_until(wake_at).await;
        }
    }

    /// Admissions currently inside the trailing window.
    pub async fn in_window(&self) -> usize {
        let log = self.log.lock().await;
        let now = Instant::now();
        log.iter()
            .filter(|ts| now.duration_since(**ts) < self.config.window)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    ServerError,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable(FailureKind),
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable(FailureKind::RateLimited)
    } else if status.is_server_error() {
        RetryDisposition::Retryable(FailureKind::ServerError)
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Linear backoff: `base + step * attempt`, with `attempt` counted from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub step: Duration,
}

impl Backoff {
    pub const fn secs(base: u64, step: u64) -> Self {
        Self {
            base: Duration::from_secs(base),
            step: Duration::from_secs(step),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_add(self.step.saturating_mul(attempt))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub rate_limited: Backoff,
    pub server_error: Backoff,
    pub network: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            rate_limited: Backoff::secs(10, 5),
            server_error: Backoff::secs(3, 2),
            network: Backoff::secs(5, 3),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, kind: FailureKind, attempt: u32) -> Duration {
        match kind {
            FailureKind::RateLimited => self.rate_limited.delay(attempt),
            FailureKind::ServerError => self.server_error.delay(attempt),
            FailureKind::Network => self.network.delay(attempt),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connect(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            Self::Connect(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }
}

/// One HTTP POST of a JSON body with bearer auth.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        bearer_token: &str,
        body: &JsonValue,
    ) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post_json(
        &self,
        url: &str,
        bearer_token: &str,
        body: &JsonValue,
    ) -> Result<TransportResponse, TransportError> {
        let resp = self
            .client
            .post(url)
            .bearer_auth(bearer_token)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.bytes().await?.to_vec();
        Ok(TransportResponse { status, body })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphqlRequest {
    #[serde(skip)]
    pub operation: &'static str,
    pub query: &'static str,
    pub variables: JsonValue,
}

#[derive(Debug, Deserialize)]
struct GraphqlEnvelope {
    #[serde(default)]
    data: Option<JsonValue>,
    #[serde(default)]
    errors: Option<Vec<GraphqlErrorMessage>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlErrorMessage {
    message: String,
}

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("network failure after {attempts} attempt(s): {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("rate limited after {attempts} attempt(s)")]
    RateLimited { attempts: u32 },
    #[error("remote service error {status} after {attempts} attempt(s)")]
    RemoteService { status: u16, attempts: u32 },
    #[error("API request failed with status {status}")]
    HttpStatus { status: u16 },
    #[error("GraphQL errors: {}", .0.join("; "))]
    Query(Vec<String>),
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

impl ApiError {
    /// Human-readable lines suitable for surfacing to the user verbatim.
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::Query(messages) => messages
                .iter()
                .map(|m| format!("GraphQL Error: {m}"))
                .collect(),
            Self::RateLimited { .. } => vec!["API request failed with status 429".to_string()],
            Self::RemoteService { status, .. } | Self::HttpStatus { status } => {
                vec![format!("API request failed with status {status}")]
            }
            Self::Transport { source, .. } => vec![format!("API request failed: {source}")],
            Self::Decode(msg) => vec![format!("Unexpected API response: {msg}")],
        }
    }

    /// The server refused the query as too expensive to execute.
    pub fn is_complexity_rejection(&self) -> bool {
        match self {
            Self::Query(messages) => messages.iter().any(|m| is_complexity_message(m)),
            _ => false,
        }
    }
}

pub fn is_complexity_message(message: &str) -> bool {
    message.to_ascii_lowercase().contains("complexity is too high")
}

enum LastFailure {
    Status(StatusCode),
    Transport(TransportError),
}

/// Issues GraphQL calls through the shared [`RateLimiter`], retrying transient failures.
pub struct GraphqlExecutor {
    endpoint: String,
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for GraphqlExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphqlExecutor")
            .field("endpoint", &self.endpoint)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl GraphqlExecutor {
    pub fn new(
        endpoint: impl Into<String>,
        transport: Arc<dyn Transport>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            transport,
            limiter,
            retry,
        }
    }

    pub fn from_config(config: &HttpClientConfig, limiter: Arc<RateLimiter>) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(config)?;
        Ok(Self::new(
            config.endpoint.clone(),
            Arc::new(transport),
            limiter,
            config.retry,
        ))
    }

    /// Runs one GraphQL request and returns its `data` object.
    pub async fn execute(&self, token: &str, request: &GraphqlRequest) -> Result<JsonValue, ApiError> {
        let body = serde_json::to_value(request)
            .map_err(|e| ApiError::Decode(format!("serializing request: {e}")))?;
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_failure = None;

        for attempt in 0..max_attempts {
            self.limiter.admit().await;

            let span = debug_span!(
                "graphql_request",
                operation = request.operation,
                attempt = attempt + 1
            );
            let result = self
                .transport
                .post_json(&self.endpoint, token, &body)
                .instrument(span)
                .await;

            let kind = match result {
                Ok(resp) if resp.status.is_success() => return decode_envelope(&resp.body),
                Ok(resp) => match classify_status(resp.status) {
                    RetryDisposition::Retryable(kind) => {
                        last_failure = Some(LastFailure::Status(resp.status));
                        kind
                    }
                    RetryDisposition::NonRetryable => {
                        warn!(operation = request.operation, status = resp.status.as_u16(), "non-retryable HTTP status");
                        return Err(ApiError::HttpStatus {
                            status: resp.status.as_u16(),
                        });
                    }
                },
                Err(err) if err.is_retryable() => {
                    last_failure = Some(LastFailure::Transport(err));
                    FailureKind::Network
                }
                Err(err) => {
                    return Err(ApiError::Transport {
                        attempts: attempt + 1,
                        source: err,
                    })
                }
            };

            if attempt + 1 < max_attempts {
                let delay = self.retry.delay_for(kind, attempt);
                warn!(
                    operation = request.operation,
                    attempt = attempt + 1,
                    ?kind,
                    delay_secs = delay.as_secs(),
                    "transient API failure; backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(match last_failure {
            Some(LastFailure::Status(status)) if status == StatusCode::TOO_MANY_REQUESTS => {
                ApiError::RateLimited {
                    attempts: max_attempts,
                }
            }
            Some(LastFailure::Status(status)) => ApiError::RemoteService {
                status: status.as_u16(),
                attempts: max_attempts,
            },
            Some(LastFailure::Transport(source)) => ApiError::Transport {
                attempts: max_attempts,
                source,
            },
            None => ApiError::Decode("request loop exited without a response".to_string()),
        })
    }
}

fn decode_envelope(body: &[u8]) -> Result<JsonValue, ApiError> {
    let envelope: GraphqlEnvelope =
        serde_json::from_slice(body).map_err(|e| ApiError::Decode(format!("invalid JSON body: {e}")))?;

    let errors = envelope.errors.unwrap_or_default();
    if !errors.is_empty() {
        return Err(ApiError::Query(errors.into_iter().map(|e| e.message).collect()));
    }

    envelope
        .data
        .filter(|d| !d.is_null())
        .ok_or_else(|| ApiError::Decode("response carried neither data nor errors".to_string()))
}

/// One fetched page of a paginated result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_pages: Option<u32>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total_pages: Option<u32>) -> Self {
        Self { items, total_pages }
    }
}

/// Walks pages 1..=N of a remote result set.
///
/// Stops at the server-reported page count, at the optional hard cap, or at the
/// first fetch failure (which is yielded once, then the sequence ends). Never
/// retries on its own and cannot be restarted.
pub struct Paginator<F> {
    fetch: F,
    next_page: u32,
    total_pages: Option<u32>,
    max_pages: Option<u32>,
    done: bool,
}

impl<F, Fut, T, E> Paginator<F>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Page<T>, E>>,
{
    pub fn new(fetch: F) -> Self {
        Self {
            fetch,
            next_page: 1,
            total_pages: None,
            max_pages: None,
            done: false,
        }
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    pub fn pages_fetched(&self) -> u32 {
        self.next_page - 1
    }

    pub async fn next_batch(&mut self) -> Option<Result<Vec<T>, E>> {
        if self.done {
            return None;
        }
        let past_total = self.total_pages.is_some_and(|total| self.next_page > total);
        let past_cap = self.max_pages.is_some_and(|cap| self.next_page > cap);
        if past_total || past_cap {
            self.done = true;
            return None;
        }

        match (self.fetch)(self.next_page).await {
            Ok(page) => {
                self.total_pages = Some(page.total_pages.unwrap_or(1));
                self.next_page += 1;
                Some(Ok(page.items))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
