//! Retry and backoff decisions.
//!
//! After a failed attempt the frontend asks [`RetryPolicy::decide`] whether
//! to try another instance. Only failures that happened before the upstream
//! could have acted on the request are retried, and only within two bounds:
//! the total attempt count and the per-request deadline, whichever is hit
//! first.

use rand::Rng;
use std::time::Duration;
use tracing::debug;

use crate::core::config::RetryConfig;
use crate::core::error::GatewayError;
use crate::core::types::{ExcludeSet, Failure, RequestContext};

/// What to do after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Wait `backoff`, then pick again avoiding every instance in `exclude`
    Retry { backoff: Duration, exclude: ExcludeSet },
    /// Stop and return this error to the caller
    GiveUp(GatewayError),
}

/// Bounded retry policy with jittered backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Deadline granted to each request
    pub fn request_deadline(&self) -> Duration {
        self.config.request_deadline
    }

    /// Timeout for the next attempt given what is left of the deadline
    pub fn attempt_timeout(&self, remaining: Duration) -> Duration {
        match self.config.attempt_timeout {
            Some(cap) => cap.min(remaining),
            None => remaining,
        }
    }

    /// Whether an attempt with this timeout is limited by the overall deadline
    /// rather than by its own cap
    pub fn bounded_by_deadline(&self, remaining: Duration) -> bool {
        self.config
            .attempt_timeout
            .map_or(true, |cap| cap >= remaining)
    }

    /// Random backoff in `[backoff_min, backoff_max]`
    #[must_use]
    pub fn backoff(&self) -> Duration {
        let min = self.config.backoff_min.as_millis() as u64;
        let max = (self.config.backoff_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Deadline-exceeded error for `ctx`
    pub fn deadline_exceeded(&self, ctx: &RequestContext, instance: Option<&str>) -> GatewayError {
        GatewayError::DeadlineExceeded {
            deadline_ms: ctx.deadline_budget().as_millis() as u64,
            instance: instance.map(str::to_string),
        }
    }

    /// Decide what follows `failure`, the outcome of the latest attempt in `ctx`
    ///
    /// Only failures from before the response headers arrive reach this
    /// point. Once headers are in, the response is committed to the caller
    /// and body-stage failures go straight to the health tracker.
    pub fn decide(&self, ctx: &RequestContext, failure: &Failure) -> RetryDecision {
        if !failure.reason.is_retryable() {
            debug!(
                request_id = %ctx.request_id,
                reason = %failure.reason,
                "Failure is not retryable"
            );
            return RetryDecision::GiveUp(GatewayError::from_failure(failure));
        }

        if ctx.attempt_count() >= self.config.max_attempts {
            debug!(
                request_id = %ctx.request_id,
                attempts = ctx.attempt_count(),
                max_attempts = self.config.max_attempts,
                "Retry attempts exhausted"
            );
            return RetryDecision::GiveUp(GatewayError::from_failure(failure));
        }

        let backoff = self.backoff();
        if backoff >= ctx.remaining() {
            return RetryDecision::GiveUp(self.deadline_exceeded(ctx, Some(&failure.instance_id)));
        }

        let mut exclude = ctx.excluded.clone();
        exclude.insert(failure.instance_id.clone());

        RetryDecision::Retry { backoff, exclude }
    }
}
