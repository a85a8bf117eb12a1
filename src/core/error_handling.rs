//! Fetch error taxonomy and retry policy
//!
//! Every failure a fetch can end with is one of five kinds. Only transient
//! network failures are retried by the coordinator; gateway commit failures
//! are retried at the commit step alone, with the verified artifact kept on
//! disk so nothing is downloaded twice.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default base delay for exponential backoff (500ms)
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Maximum delay cap for exponential backoff (30 seconds)
pub const MAX_DELAY_CAP: Duration = Duration::from_secs(30);

/// Error kind attached to a failed `DownloadStatus`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// Timeouts, dropped connections, 5xx and 429 responses
    TransientNetwork,
    /// 404, auth failures, unsupported content, malformed documents
    PermanentFetch,
    /// Size or digest disagrees with catalog metadata
    ChecksumMismatch,
    /// The local store refused the commit
    GatewayCommit,
    /// Stopped on request; not a failure
    Cancelled,
}

/// Failure of a single fetch
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("transient network error: {message}")]
    TransientNetwork {
        message: String,
        status: Option<u16>,
    },

    #[error("permanent fetch error: {message}")]
    PermanentFetch {
        message: String,
        status: Option<u16>,
    },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("gateway commit failed: {message}")]
    GatewayCommit { message: String },

    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::TransientNetwork { .. } => FetchErrorKind::TransientNetwork,
            Self::PermanentFetch { .. } => FetchErrorKind::PermanentFetch,
            Self::ChecksumMismatch { .. } => FetchErrorKind::ChecksumMismatch,
            Self::GatewayCommit { .. } => FetchErrorKind::GatewayCommit,
            Self::Cancelled => FetchErrorKind::Cancelled,
        }
    }

    /// Whether the whole transfer may be attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. })
    }

    /// HTTP status behind the error, when there was one
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::TransientNetwork { status, .. } | Self::PermanentFetch { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return classify_status(status, &err.to_string());
        }

        if err.is_builder() {
            return errors::permanent(format!("invalid request: {}", err));
        }

        // connect / timeout / body / decode failures are worth another try
        FetchError::TransientNetwork {
            message: err.to_string(),
            status: None,
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        // local disk trouble is not fixed by hammering the network again
        errors::permanent(format!("local I/O error: {}", err))
    }
}

/// Map an HTTP status onto the taxonomy
pub fn classify_status(status: StatusCode, context: &str) -> FetchError {
    let message = format!("HTTP {} ({})", status, context);
    let code = Some(status.as_u16());

    let transient = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.as_u16() == 425;

    if transient {
        FetchError::TransientNetwork {
            message,
            status: code,
        }
    } else {
        FetchError::PermanentFetch {
            message,
            status: code,
        }
    }
}

/// Retry strategy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of transfer attempts, the first one included
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff multiplier (typically 2.0 for exponential)
    pub backoff_multiplier: f64,
    /// Add random jitter to prevent thundering herd
    pub jitter_enabled: bool,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: MAX_DELAY_CAP,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy without delays, for tests and manual passes
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_enabled: false,
            ..Default::default()
        }
    }

    /// Whether attempt number `attempt` (1-based) may be followed by another
    pub fn should_retry(&self, error: &FetchError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let delay_ms =
            self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let mut delay = Duration::from_millis(delay_ms as u64);

        // Apply maximum delay cap
        if delay > self.max_delay {
            delay = self.max_delay;
        }

        // Apply jitter if enabled
        if self.jitter_enabled && !delay.is_zero() {
            let jitter = delay.as_millis() as f64
                * self.jitter_factor
                * (rand::random::<f64>() - 0.5);
            let jittered_delay = delay.as_millis() as i64 + jitter as i64;
            delay = Duration::from_millis(jittered_delay.max(0) as u64);
        }

        delay
    }
}

/// Convenience constructors for common error shapes
pub mod errors {
    use super::*;

    pub fn transient(message: impl Into<String>) -> FetchError {
        FetchError::TransientNetwork {
            message: message.into(),
            status: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> FetchError {
        FetchError::PermanentFetch {
            message: message.into(),
            status: None,
        }
    }

    pub fn checksum_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> FetchError {
        FetchError::ChecksumMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn gateway_commit(message: impl Into<String>) -> FetchError {
        FetchError::GatewayCommit {
            message: message.into(),
        }
    }

    pub fn timed_out(limit: Duration) -> FetchError {
        transient(format!("fetch exceeded {:?}", limit))
    }
}
