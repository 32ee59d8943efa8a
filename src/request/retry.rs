//! Retry policy for API requests.
//!
//! The decider is invoked once per attempt, not per request: each failed
//! attempt is fed back in with its attempt number so the linear backoff
//! schedule can be computed without any hidden state.

use std::time::Duration;

use reqwest::StatusCode;

/// The retry schedule for one HTTP call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    max_retries: u32,
    /// Base backoff; attempt `n` sleeps `backoff * (n + 1)`.
    backoff: Duration,
}

/// What the transport observed for a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The connection could not be established (refused, timed out).
    ConnectionFailed,
    /// A response was received with this status.
    Status(StatusCode),
}

/// What the transport should do with an attempt's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    /// Hand the response back to the caller to interpret.
    Return,
    /// Sleep for the given duration, then try again.
    RetryAfter(Duration),
    /// The retry budget is exhausted.
    Fail,
}

impl RetryPolicy {
    /// The default maximum number of retries.
    pub const DEFAULT_MAX_RETRIES: u32 = 5;

    /// The default backoff base in seconds.
    pub const DEFAULT_BACKOFF_SECS: u64 = 5;

    /// The hard cap on configured retries.
    pub const MAX_RETRIES_CAP: u32 = 10;

    /// The floor on the configured backoff base.
    pub const BACKOFF_FLOOR: Duration = Duration::from_secs(3);

    /// Creates a policy from raw configuration values, applying the retry
    /// cap and the backoff floor.
    pub fn new(max_retries: u32, backoff_secs: u64) -> Self {
        Self {
            max_retries: max_retries.min(Self::MAX_RETRIES_CAP),
            backoff: Duration::from_secs(backoff_secs).max(Self::BACKOFF_FLOOR),
        }
    }

    /// The effective maximum number of retries.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The delay to sleep before retrying attempt `attempt` (zero-based
    /// count of failures so far).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff * (attempt + 1)
    }

    /// Decides what to do with the outcome of attempt `attempt`.
    ///
    /// 2xx and 4xx responses are never retried; they are returned for the
    /// caller to interpret (including 409 conflicts). Connection failures
    /// and every other status retry on the linear schedule until the budget
    /// runs out.
    pub(crate) fn decide(&self, attempt: u32, outcome: Outcome) -> Decision {
        if let Outcome::Status(status) = outcome
            && (status.is_success() || status.is_client_error())
        {
            return Decision::Return;
        }

        if attempt >= self.max_retries {
            return Decision::Fail;
        }

        Decision::RetryAfter(self.delay(attempt))
    }
}
