use std::time::Duration;

use thiserror::Error;

/// Fallback cool-down applied when a provider throttles without telling us
/// for how long.
pub const DEFAULT_RATE_LIMIT_PAUSE: Duration = Duration::from_secs(60);

/// Uniform failure taxonomy for a send attempt.
///
/// The orchestrator retries temporary failures and abandons permanent ones,
/// so classification accuracy matters more than the message text. When in
/// doubt an adapter should classify as [`SendError::Unknown`] (temporary);
/// retrying is preferable to silently dropping a message.
#[derive(Debug, Error)]
pub enum SendError {
    /// Required configuration missing or malformed. Permanent.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Disallowed operation detected before any network call, e.g. an
    /// attachment referencing a non-http source. Permanent and local.
    #[error("security violation: {0}")]
    Security(String),
    /// Malformed request rejected by the provider. Permanent.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Bad or expired credentials. Permanent.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Provider throttling; carries a cool-down hint for the whole adapter.
    #[error("rate limited: {reason}")]
    RateLimited { reason: String, pause: Duration },
    /// Provider-side 5xx. Temporary.
    #[error("provider server error: {0}")]
    Server(String),
    /// Connection-level failure. Temporary.
    #[error("network error: {0}")]
    Network(String),
    /// The attempt was cancelled after the per-attempt deadline. Temporary.
    #[error("timed out: {0}")]
    Timeout(String),
    /// Anything we could not classify. Treated as temporary.
    #[error("{0}")]
    Unknown(String),
}

impl SendError {
    pub fn rate_limited(reason: impl Into<String>, pause: Option<Duration>) -> Self {
        Self::RateLimited {
            reason: reason.into(),
            pause: pause.unwrap_or(DEFAULT_RATE_LIMIT_PAUSE),
        }
    }

    /// Whether the orchestrator should retry this send later.
    pub fn is_temporary(&self) -> bool {
        match self {
            Self::Configuration(_)
            | Self::Security(_)
            | Self::Validation(_)
            | Self::Auth(_) => false,
            Self::RateLimited { .. }
            | Self::Server(_)
            | Self::Network(_)
            | Self::Timeout(_)
            | Self::Unknown(_) => true,
        }
    }

    /// Adapter-wide cool-down hint, when the provider signalled one.
    pub fn pause(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { pause, .. } => Some(*pause),
            _ => None,
        }
    }

    /// True when the failure was detected before any network call.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Security(_))
    }
}

/// Baseline HTTP status classification shared by all adapters.
///
/// Per-provider error codes are layered on top of this and take precedence;
/// a provider-permanent failure stays permanent even when it arrives under a
/// temporary-looking status code.
pub fn classify_status(status: u16, detail: impl Into<String>) -> SendError {
    let detail = detail.into();
    match status {
        429 => SendError::rate_limited(detail, None),
        401 | 402 | 403 => SendError::Auth(detail),
        400 | 404 | 405 | 406 | 410 | 413 | 415 | 422 => SendError::Validation(detail),
        500 | 502 | 503 | 504 => SendError::Server(detail),
        _ => SendError::Unknown(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_and_permanent_split() {
        assert!(classify_status(429, "x").is_temporary());
        assert!(classify_status(503, "x").is_temporary());
        assert!(!classify_status(401, "x").is_temporary());
        assert!(!classify_status(404, "x").is_temporary());
        // Unknown statuses stay retryable rather than dropping the message.
        assert!(classify_status(418, "x").is_temporary());
    }

    #[test]
    fn rate_limit_carries_default_pause() {
        let err = classify_status(429, "slow down");
        assert_eq!(err.pause(), Some(DEFAULT_RATE_LIMIT_PAUSE));
    }

    #[test]
    fn local_errors_are_flagged() {
        assert!(SendError::Security("file scheme".into()).is_local());
        assert!(!SendError::Network("refused".into()).is_local());
    }
}
