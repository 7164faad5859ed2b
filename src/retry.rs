//! Retry policy: what to retry, and how long to wait
//!
//! Classification goes through [`IsRetryable`]; the orchestrator is the only
//! place that acts on it. Timing follows a randomized exponential back-off:
//! after the n-th consecutive failure the delay is drawn uniformly from
//! `[0, ceiling(n))`, where the ceilings come from a [`BackoffSchedule`]
//! (default 1 second, 1 minute, 1 hour, 6 hours) and saturate at the last
//! entry.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use rand::Rng;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, unreachable hosts, connection resets, 5xx
/// statuses) return `true`. Failures whose outcome will not change on retry
/// (4xx statuses, bad content type, oversized responses, sink failures,
/// cancellation) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the request should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Connectivity failures reported by the HTTP client
            Error::Transport(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.is_body()
                    || has_transient_io_source(e.as_ref())
            }
            // I/O errors can be retryable in some cases
            Error::Io(e) => is_transient_io(e.kind()),
            // Server-side trouble may clear up; client errors will not
            Error::Status { code } => (500..=599).contains(code),
            // A different content type is unlikely on retry
            Error::BadContentType { .. } => false,
            // Resource-exhaustion guard, not a transient condition
            Error::ResponseTooLarge { .. } => false,
            Error::OutputStream(_) => false,
            Error::Cancelled => false,
            Error::InvalidRequest(_) => false,
            Error::Config { .. } => false,
            Error::Serialization(_) => false,
            Error::Other(_) => false,
        }
    }
}

fn is_transient_io(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::Interrupted
    )
}

fn has_transient_io_source(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = error.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if is_transient_io(io.kind()) {
                return true;
            }
        }
        source = err.source();
    }
    false
}

/// Ordered maximum-delay ceilings for consecutive retries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    ceilings: Vec<Duration>,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            ceilings: RetryConfig::default().schedule,
        }
    }
}

impl TryFrom<&RetryConfig> for BackoffSchedule {
    type Error = Error;

    fn try_from(config: &RetryConfig) -> Result<Self> {
        Self::new(config.schedule.clone())
    }
}

impl BackoffSchedule {
    /// Build a schedule; ceilings must be non-empty and non-decreasing
    pub fn new(ceilings: Vec<Duration>) -> Result<Self> {
        if ceilings.is_empty() {
            return Err(Error::config(
                "backoff schedule must contain at least one ceiling",
                "retry.schedule",
            ));
        }
        if ceilings.windows(2).any(|w| w[1] < w[0]) {
            return Err(Error::config(
                "backoff ceilings must be non-decreasing",
                "retry.schedule",
            ));
        }
        Ok(Self { ceilings })
    }

    /// Ceilings in order
    pub fn ceilings(&self) -> &[Duration] {
        &self.ceilings
    }

    /// Ceiling for the `retry_count`-th retry (1-based)
    ///
    /// Indexed by the number of retries that came before this one, saturating
    /// at the last entry. `retry_count == 0` is treated like the first retry.
    pub fn ceiling(&self, retry_count: u32) -> Duration {
        let index = (retry_count.saturating_sub(1) as usize).min(self.ceilings.len() - 1);
        self.ceilings[index]
    }

    /// Draw the delay before the `retry_count`-th retry from `[0, ceiling)`
    pub fn delay(&self, retry_count: u32) -> Duration {
        random_delay_below(self.ceiling(retry_count))
    }
}

/// Uniform random delay in `[0, ceiling)`; zero for a zero ceiling
fn random_delay_below(ceiling: Duration) -> Duration {
    let nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
}
