//! Resilient outbound HTTP with bounded retries.
//!
//! Every adapter funnels its provider calls through [`RequestEngine`]: one
//! logical call spans up to `1 + max_retries` attempts, separated by
//! exponential backoff with jitter (or an exact server-supplied hint), each
//! attempt individually cancellable by timeout. Rate-limit headers are
//! parsed into a caller-visible snapshot after every response; the snapshot
//! is informational only and never throttles.

use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use courier_core::{classify_status, SendError};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use rand::Rng;
use time::OffsetDateTime;
use tracing::{debug, warn};

const JITTER_FACTOR: f64 = 0.25;
const MAX_ERROR_BODY: usize = 2048;

/// Retry policy for one logical provider call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Response statuses that trigger a retry when attempts remain.
    pub retry_on: Vec<u16>,
    pub retry_on_timeout: bool,
    pub retry_on_network: bool,
    /// Per-attempt deadline; aborts only the in-flight attempt, never the
    /// logical call.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            retry_on: vec![429, 500, 502, 503, 504],
            retry_on_timeout: true,
            retry_on_network: true,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Method/URL/headers/body tuple, cheap to clone per attempt.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl PreparedRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Adds a header; invalid names/values are skipped with a warning rather
    /// than failing the whole send.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => warn!(header = name, "skipping unrepresentable header"),
        }
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("authorization", &format!("Bearer {token}"))
    }

    pub fn json(mut self, value: &serde_json::Value) -> Self {
        self.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = Some(Bytes::from(value.to_string()));
        self
    }

    pub fn body(mut self, bytes: impl Into<Bytes>, content_type: &str) -> Self {
        self.body = Some(bytes.into());
        if let Ok(value) = HeaderValue::from_str(content_type) {
            self.headers.insert(http::header::CONTENT_TYPE, value);
        }
        self
    }
}

/// Successful (2xx) response with the body fully read.
#[derive(Debug, Clone)]
pub struct EngineResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl EngineResponse {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Last observed rate-limit headers for this engine instance.
#[derive(Debug, Clone, Default)]
pub struct RateLimitSnapshot {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_at: Option<OffsetDateTime>,
}

/// Classified failure after the retry loop gave up, annotated with the
/// number of attempts actually made.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("HTTP {status} after {attempts} attempt(s): {body}")]
    Status {
        status: u16,
        body: String,
        retry_after: Option<u64>,
        attempts: u32,
    },
    #[error("request timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },
    #[error("network failure after {attempts} attempt(s): {detail}")]
    Network { detail: String, attempts: u32 },
}

impl EngineError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Status { attempts, .. }
            | Self::Timeout { attempts }
            | Self::Network { attempts, .. } => *attempts,
        }
    }

    /// Maps the transport-level failure into the uniform send taxonomy.
    pub fn classify(&self) -> SendError {
        match self {
            Self::Status {
                status: 429,
                body,
                retry_after,
                ..
            } => SendError::rate_limited(body.clone(), retry_after.map(Duration::from_secs)),
            Self::Status { status, body, .. } => classify_status(*status, body.clone()),
            Self::Timeout { attempts } => {
                SendError::Timeout(format!("gave up after {attempts} attempt(s)"))
            }
            Self::Network { detail, .. } => SendError::Network(detail.clone()),
        }
    }
}

/// Computes the suspension before retrying `attempt` (0-based).
///
/// A server-supplied hint wins and is exact: `min(hint_seconds * 1000,
/// max_delay)`, no jitter. Otherwise `base_delay * 2^attempt` with ±25%
/// uniform jitter, clamped to `[0, max_delay]`.
pub fn backoff_delay(attempt: u32, policy: &RetryPolicy, hint_seconds: Option<u64>) -> Duration {
    if let Some(hint) = hint_seconds {
        return Duration::from_millis((hint.saturating_mul(1000)).min(policy.max_delay.as_millis() as u64));
    }

    let exponent = attempt.min(20);
    let raw = policy.base_delay.as_millis() as f64 * f64::from(2u32.saturating_pow(exponent));
    let jitter_range = raw * JITTER_FACTOR;
    let offset = rand::rng().random_range(-jitter_range..=jitter_range);
    let jittered = (raw + offset).max(0.0);
    Duration::from_millis((jittered as u64).min(policy.max_delay.as_millis() as u64))
}

fn parse_header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    parse_header_u64(headers, "retry-after")
}

/// Reads the common `(x-)ratelimit-*` header triple. The reset value is
/// accepted either as epoch seconds or as a delta from now.
pub fn parse_rate_limit(headers: &HeaderMap) -> Option<RateLimitSnapshot> {
    let pick = |suffix: &str| {
        parse_header_u64(headers, &format!("x-ratelimit-{suffix}"))
            .or_else(|| parse_header_u64(headers, &format!("ratelimit-{suffix}")))
    };
    let limit = pick("limit");
    let remaining = pick("remaining");
    let reset = pick("reset");
    if limit.is_none() && remaining.is_none() && reset.is_none() {
        return None;
    }
    let reset_at = reset.map(|value| {
        if value >= 1_000_000_000 {
            OffsetDateTime::from_unix_timestamp(value as i64)
                .unwrap_or_else(|_| OffsetDateTime::now_utc())
        } else {
            OffsetDateTime::now_utc() + Duration::from_secs(value)
        }
    });
    Some(RateLimitSnapshot {
        limit,
        remaining,
        reset_at,
    })
}

/// Retry-aware HTTP client shared by adapters and usable standalone.
#[derive(Debug)]
pub struct RequestEngine {
    client: reqwest::Client,
    policy: RetryPolicy,
    last_rate_limit: Mutex<Option<RateLimitSnapshot>>,
}

impl RequestEngine {
    /// Builds an engine with its own client. Pure construction, no I/O.
    pub fn new(policy: RetryPolicy) -> Result<Self, SendError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("courier-request/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| SendError::Configuration(format!("http client: {err}")))?;
        Ok(Self::with_client(client, policy))
    }

    pub fn with_client(client: reqwest::Client, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            last_rate_limit: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Last rate-limit snapshot observed on any response, informational only.
    pub fn last_rate_limit(&self) -> Option<RateLimitSnapshot> {
        self.last_rate_limit
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    fn record_rate_limit(&self, headers: &HeaderMap) {
        if let Some(snapshot) = parse_rate_limit(headers) {
            if let Ok(mut guard) = self.last_rate_limit.lock() {
                *guard = Some(snapshot);
            }
        }
    }

    /// Executes one logical call: attempt 0..=max_retries, returning the
    /// first 2xx response or the last classified failure.
    pub async fn execute(&self, request: &PreparedRequest) -> Result<EngineResponse, EngineError> {
        let policy = &self.policy;
        let mut attempt: u32 = 0;

        loop {
            let attempts_made = attempt + 1;
            match self.attempt(request).await {
                Ok(response) => {
                    self.record_rate_limit(&response.headers);
                    if (200..300).contains(&response.status) {
                        return Ok(response);
                    }

                    let status = response.status;
                    let retry_after = parse_retry_after(&response.headers);
                    if policy.retry_on.contains(&status) && attempt < policy.max_retries {
                        let delay = backoff_delay(attempt, policy, retry_after);
                        debug!(status, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    let mut body = response.text();
                    body.truncate(MAX_ERROR_BODY);
                    return Err(EngineError::Status {
                        status,
                        body,
                        retry_after,
                        attempts: attempts_made,
                    });
                }
                Err(err) if err.is_timeout() => {
                    if policy.retry_on_timeout && attempt < policy.max_retries {
                        let delay = backoff_delay(attempt, policy, None);
                        debug!(attempt, delay_ms = delay.as_millis() as u64, "timeout, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(EngineError::Timeout {
                        attempts: attempts_made,
                    });
                }
                Err(err) => {
                    if policy.retry_on_network && attempt < policy.max_retries {
                        let delay = backoff_delay(attempt, policy, None);
                        debug!(attempt, error = %err, "network failure, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(EngineError::Network {
                        detail: err.to_string(),
                        attempts: attempts_made,
                    });
                }
            }
        }
    }

    async fn attempt(&self, request: &PreparedRequest) -> Result<EngineResponse, reqwest::Error> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone())
            .timeout(self.policy.attempt_timeout);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(EngineResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[test]
    fn backoff_stays_within_bounds() {
        let policy = policy();
        for attempt in 0..=policy.max_retries {
            for _ in 0..100 {
                let delay = backoff_delay(attempt, &policy, None);
                assert!(delay <= policy.max_delay, "attempt {attempt}: {delay:?}");
            }
        }
    }

    #[test]
    fn server_hint_is_exact_and_capped() {
        let policy = policy();
        assert_eq!(
            backoff_delay(0, &policy, Some(2)),
            Duration::from_millis(2000)
        );
        // A huge hint is clamped to max_delay rather than honored verbatim.
        assert_eq!(backoff_delay(0, &policy, Some(86_400)), policy.max_delay);
    }

    #[test]
    fn backoff_jitter_varies() {
        let policy = policy();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            seen.insert(backoff_delay(1, &policy, None).as_millis());
        }
        assert!(seen.len() > 1, "jitter should vary delays");
        // ±25% of 2000ms.
        for ms in &seen {
            assert!(*ms >= 1500 && *ms <= 2500, "out of jitter band: {ms}ms");
        }
    }

    #[test]
    fn rate_limit_parsing_handles_epoch_and_delta() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-limit", HeaderValue::from_static("100"));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("7"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("30"));
        let snap = parse_rate_limit(&headers).unwrap();
        assert_eq!(snap.limit, Some(100));
        assert_eq!(snap.remaining, Some(7));
        let reset = snap.reset_at.unwrap();
        assert!(reset > OffsetDateTime::now_utc());

        headers.insert("x-ratelimit-reset", HeaderValue::from_static("4102444800"));
        let snap = parse_rate_limit(&headers).unwrap();
        assert_eq!(snap.reset_at.unwrap().year(), 2100);

        assert!(parse_rate_limit(&HeaderMap::new()).is_none());
    }

    #[test]
    fn engine_error_classification() {
        let status = EngineError::Status {
            status: 429,
            body: "slow down".into(),
            retry_after: Some(120),
            attempts: 4,
        };
        let classified = status.classify();
        assert!(classified.is_temporary());
        assert_eq!(classified.pause(), Some(Duration::from_secs(120)));

        let denied = EngineError::Status {
            status: 401,
            body: "bad key".into(),
            retry_after: None,
            attempts: 1,
        };
        assert!(!denied.classify().is_temporary());

        assert!(EngineError::Timeout { attempts: 2 }.classify().is_temporary());
    }
}
