//! Error and retry-policy types for the Relay dispatch domain.
//!
//! [`DispatchError`] covers conditions that fail a whole `handle_event` or
//! `handle_comment` call. The port errors ([`StoreError`], [`VcsError`],
//! [`TriggerError`]) are produced by infrastructure adapters; of these only
//! [`TriggerError`] is caught and isolated per candidate by the dispatcher.
//!
//! [`RetryPolicy`] is a cross-cutting concern: any error type that participates
//! in retry decisions must be able to produce a [`RetryPolicy`]. Retrying is
//! the adapters' job; the dispatcher never retries.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{CiEndpoint, JobName};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// Returned by infrastructure error types to let an adapter decide whether to
/// re-issue a request before giving up.
///
/// - `Retryable` errors: timeouts, connection resets, 5xx and 429 responses.
/// - `NonRetryable` errors: authentication failures, unknown endpoints,
///   malformed responses, every other 4xx.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    ///
    /// `after` optionally specifies the minimum delay before retrying (e.g.
    /// derived from a `Retry-After` response header).
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

impl RetryPolicy {
    /// Classifies an HTTP status code returned by a remote service.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            429 | 500..=599 => RetryPolicy::Retryable { after: retry_after },
            _ => RetryPolicy::NonRetryable,
        }
    }

    /// Returns `true` for [`RetryPolicy::Retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetryPolicy::Retryable { .. })
    }
}

/// Upper bound on a computed back-off delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Bounded exponential back-off used by the HTTP adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Total attempts, including the first one. Never less than 1.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for each later one.
    pub base_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl Backoff {
    /// Returns how long to wait before retrying after failed attempt number
    /// `attempt` (1-based), or `None` when the caller must give up.
    ///
    /// A `Retry-After` carried by `policy` takes precedence over the schedule.
    pub fn delay(&self, attempt: u32, policy: &RetryPolicy) -> Option<Duration> {
        let RetryPolicy::Retryable { after } = policy else {
            return None;
        };
        if attempt >= self.max_attempts.max(1) {
            return None;
        }
        let scheduled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        Some(after.unwrap_or(scheduled).min(MAX_BACKOFF))
    }
}

/// Parses a `Retry-After` header given in whole seconds.
///
/// HTTP-date values are not supported and yield `None`.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value?.trim().parse::<u64>().ok().map(Duration::from_secs)
}

// ---------------------------------------------------------------------------
// Port errors
// ---------------------------------------------------------------------------

/// Failure reading from or writing to the registration store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing storage could not be read or written.
    #[error("registration storage unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be decoded.
    #[error("stored registration is corrupt: {0}")]
    Corrupt(String),
}

/// Failure talking to the VCS host.
#[derive(Debug, Error)]
pub enum VcsError {
    /// The VCS host answered with an unexpected status.
    #[error("VCS request '{operation}' failed with status {status}: {message}")]
    Status {
        /// Short name of the attempted operation (e.g. `"list_pr_labels"`).
        operation: &'static str,
        /// HTTP status code returned by the host.
        status: u16,
        /// Response body excerpt.
        message: String,
        /// Whether the request may be retried.
        retry: RetryPolicy,
    },

    /// The request never produced a response.
    #[error("VCS request '{operation}' could not be sent: {message}")]
    Transport {
        /// Short name of the attempted operation.
        operation: &'static str,
        /// Transport-level error description.
        message: String,
    },

    /// The host answered successfully but the body could not be understood.
    #[error("VCS response for '{operation}' could not be decoded: {message}")]
    Decode {
        /// Short name of the attempted operation.
        operation: &'static str,
        /// Decoder error description.
        message: String,
    },
}

impl VcsError {
    /// Returns whether the failed request may be retried.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            VcsError::Status { retry, .. } => retry.clone(),
            VcsError::Transport { .. } => RetryPolicy::Retryable { after: None },
            VcsError::Decode { .. } => RetryPolicy::NonRetryable,
        }
    }
}

/// Failure invoking a CI job.
///
/// Caught by the dispatcher at the per-candidate isolation boundary: one
/// failing trigger never aborts the remaining candidates.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// No credentials or client are configured for the requested CI endpoint.
    #[error("no CI server configured for endpoint {0}")]
    UnknownEndpoint(CiEndpoint),

    /// The CI server refused or failed the trigger request.
    #[error("CI server rejected job '{job}' with status {status}: {message}")]
    Rejected {
        /// The job that was being triggered.
        job: JobName,
        /// HTTP status code returned by the CI server.
        status: u16,
        /// Response body excerpt.
        message: String,
        /// Whether the request may be retried.
        retry: RetryPolicy,
    },

    /// The request never produced a response.
    #[error("trigger request for job '{job}' could not be sent: {message}")]
    Transport {
        /// The job that was being triggered.
        job: JobName,
        /// Transport-level error description.
        message: String,
    },
}

impl TriggerError {
    /// Returns whether the failed trigger may be retried.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            TriggerError::UnknownEndpoint(_) => RetryPolicy::NonRetryable,
            TriggerError::Rejected { retry, .. } => retry.clone(),
            TriggerError::Transport { .. } => RetryPolicy::Retryable { after: None },
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch-level errors
// ---------------------------------------------------------------------------

/// Errors that fail an entire `handle_event` / `handle_comment` call.
///
/// Trigger failures are deliberately absent: they are isolated per candidate
/// and reported through [`crate::DispatchOutcome::Dispatched::failed`].
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The payload lacks a field required for its declared event kind.
    ///
    /// This is a contract violation by the upstream sender and is surfaced
    /// to the caller rather than ignored.
    #[error("malformed '{event}' payload: {detail}")]
    MalformedPayload {
        /// The transport-level event name the payload was declared as.
        event: String,
        /// Which field was missing or invalid.
        detail: String,
    },

    /// The registration store could not be queried.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A VCS lookup needed for restriction evaluation or a resync failed.
    #[error(transparent)]
    Vcs(#[from] VcsError),

    /// The background task running a submitted dispatch panicked or was
    /// cancelled by runtime shutdown.
    #[error("dispatch task did not complete: {0}")]
    TaskFailed(String),
}

impl DispatchError {
    /// Builds a [`DispatchError::MalformedPayload`].
    pub fn malformed(event: impl Into<String>, detail: impl Into<String>) -> Self {
        DispatchError::MalformedPayload {
            event: event.into(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_rate_limits_are_retryable() {
        assert!(RetryPolicy::from_status(503, None).is_retryable());
        assert!(RetryPolicy::from_status(429, None).is_retryable());
        assert_eq!(RetryPolicy::from_status(404, None), RetryPolicy::NonRetryable);
        assert_eq!(RetryPolicy::from_status(401, None), RetryPolicy::NonRetryable);
    }

    #[test]
    fn retry_after_is_carried_through() {
        let after = Some(Duration::from_secs(7));
        assert_eq!(
            RetryPolicy::from_status(429, after),
            RetryPolicy::Retryable { after }
        );
    }

    #[test]
    fn backoff_doubles_until_attempts_run_out() {
        let backoff = Backoff {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        };
        let retry = RetryPolicy::Retryable { after: None };
        assert_eq!(backoff.delay(1, &retry), Some(Duration::from_millis(100)));
        assert_eq!(backoff.delay(2, &retry), Some(Duration::from_millis(200)));
        assert_eq!(backoff.delay(3, &retry), None);
        assert_eq!(backoff.delay(1, &RetryPolicy::NonRetryable), None);
    }

    #[test]
    fn retry_after_overrides_the_schedule_but_is_capped() {
        let backoff = Backoff::default();
        let short = RetryPolicy::Retryable {
            after: Some(Duration::from_secs(2)),
        };
        let long = RetryPolicy::Retryable {
            after: Some(Duration::from_secs(3600)),
        };
        assert_eq!(backoff.delay(1, &short), Some(Duration::from_secs(2)));
        assert_eq!(backoff.delay(1, &long), Some(MAX_BACKOFF));
    }

    #[test]
    fn retry_after_accepts_only_seconds() {
        assert_eq!(parse_retry_after(Some(" 12 ")), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after(Some("Wed, 21 Oct 2015 07:28:00 GMT")), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn unknown_endpoints_are_never_retried() {
        let err = TriggerError::UnknownEndpoint(CiEndpoint::new("http://ci").unwrap());
        assert_eq!(err.retry_policy(), RetryPolicy::NonRetryable);
    }
}
