//! # Core Types Module
//!
//! Request-scoped data structures shared by the proxy engine, the retry
//! controller and the frontend.
//!
//! ## Ownership
//!
//! - [`RequestContext`] is owned by the task handling one inbound request and
//!   is never shared with another request.
//! - The inbound body is held as [`Bytes`] so every attempt can replay it
//!   without copying.
//! - [`Attempt`] records are created per retry iteration and dropped together
//!   with the context.

use axum::http::{HeaderMap, Method, Uri, Version};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Header used to propagate the request id to upstreams and back to callers
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Header naming the instance that produced a proxied response
pub const UPSTREAM_INSTANCE_HEADER: &str = "x-upstream-instance";

/// Instance ids already tried for the current request
pub type ExcludeSet = HashSet<String>;

/// Reuse the caller's `x-request-id` when it looks sane, otherwise mint one
pub fn request_id_from(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Why a single upstream attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// TCP connect refused, unreachable or timed out
    ConnectFailed,
    /// No response headers within the attempt timeout
    Timeout,
    /// Connection closed or reset after it was established
    UpstreamReset,
    /// The upstream did not speak valid HTTP
    ProtocolError,
}

impl FailureReason {
    /// Reason code used in error bodies, logs and metric labels
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::ConnectFailed => "connect_failed",
            FailureReason::Timeout => "timeout",
            FailureReason::UpstreamReset => "upstream_reset",
            FailureReason::ProtocolError => "protocol_error",
        }
    }

    /// Only failures that happened before the upstream saw the request are
    /// safe to replay on another instance
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureReason::ConnectFailed | FailureReason::Timeout)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A failed attempt against one instance
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub reason: FailureReason,
    /// Id of the instance, never its address
    pub instance_id: String,
    /// Transport detail, for logs only
    pub message: String,
    /// Time spent on the attempt
    pub elapsed: Duration,
}

impl Failure {
    pub fn new<I: Into<String>, M: Into<String>>(
        reason: FailureReason,
        instance_id: I,
        message: M,
        elapsed: Duration,
    ) -> Self {
        Self {
            reason,
            instance_id: instance_id.into(),
            message: message.into(),
            elapsed,
        }
    }
}

/// Outcome of one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Pending,
    Success,
    Failed(Failure),
}

/// One iteration of the retry loop
#[derive(Debug, Clone)]
pub struct Attempt {
    pub request_id: String,
    pub instance_id: String,
    pub started_at: Instant,
    /// Point in time after which this attempt is abandoned
    pub deadline: Instant,
    pub outcome: AttemptOutcome,
}

/// Everything the gateway knows about one inbound request
///
/// Built once the route is resolved and the body has been collected. The
/// deadline is fixed at creation and never extended by retries.
#[derive(Debug)]
pub struct RequestContext {
    /// Request id, taken from the inbound `x-request-id` or generated
    pub request_id: String,

    /// Trace id for correlating log lines
    pub trace_id: String,

    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,

    /// Collected inbound body, replayed on every attempt
    pub body: Bytes,

    /// Caller address, when the listener provides it
    pub remote_addr: Option<SocketAddr>,

    pub received_at: Instant,
    pub deadline: Instant,

    /// Number of retries performed so far (attempts minus one)
    pub retry_count: u32,

    /// Instances that already failed for this request
    pub excluded: ExcludeSet,

    pub attempts: Vec<Attempt>,
}

impl RequestContext {
    pub fn new(
        method: Method,
        uri: Uri,
        version: Version,
        headers: HeaderMap,
        body: Bytes,
        remote_addr: Option<SocketAddr>,
        deadline: Duration,
    ) -> Self {
        let received_at = Instant::now();
        let request_id = request_id_from(&headers);

        Self {
            request_id,
            trace_id: Uuid::new_v4().to_string(),
            method,
            uri,
            version,
            headers,
            body,
            remote_addr,
            received_at,
            deadline: received_at + deadline,
            retry_count: 0,
            excluded: ExcludeSet::new(),
            attempts: Vec::new(),
        }
    }

    /// Time left before the overall deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Total deadline granted to this request
    pub fn deadline_budget(&self) -> Duration {
        self.deadline.saturating_duration_since(self.received_at)
    }

    pub fn elapsed(&self) -> Duration {
        self.received_at.elapsed()
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Number of attempts started so far
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Record the start of a new attempt against `instance_id`
    pub fn begin_attempt(&mut self, instance_id: &str, timeout: Duration) {
        let started_at = Instant::now();
        self.attempts.push(Attempt {
            request_id: self.request_id.clone(),
            instance_id: instance_id.to_string(),
            started_at,
            deadline: started_at + timeout,
            outcome: AttemptOutcome::Pending,
        });
    }

    /// Close the most recent attempt
    pub fn finish_attempt(&mut self, outcome: AttemptOutcome) {
        if let Some(attempt) = self.attempts.last_mut() {
            attempt.outcome = outcome;
        }
    }

    /// Failure of the most recent failed attempt, if any
    pub fn last_failure(&self) -> Option<&Failure> {
        self.attempts.iter().rev().find_map(|attempt| match &attempt.outcome {
            AttemptOutcome::Failed(failure) => Some(failure),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn context(headers: HeaderMap) -> RequestContext {
        RequestContext::new(
            Method::GET,
            Uri::from_static("/books/12"),
            Version::HTTP_11,
            headers,
            Bytes::new(),
            None,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_failure_reason_retryability() {
        assert!(FailureReason::ConnectFailed.is_retryable());
        assert!(FailureReason::Timeout.is_retryable());
        assert!(!FailureReason::UpstreamReset.is_retryable());
        assert!(!FailureReason::ProtocolError.is_retryable());
    }

    #[test]
    fn test_request_id_is_propagated() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc-123"));
        assert_eq!(context(headers).request_id, "abc-123");

        let generated = context(HeaderMap::new());
        assert!(Uuid::parse_str(&generated.request_id).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_deadline_shrinks() {
        let ctx = context(HeaderMap::new());
        assert_eq!(ctx.remaining(), Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(ctx.remaining(), Duration::from_secs(3));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(ctx.remaining(), Duration::ZERO);
        assert_eq!(ctx.deadline_budget(), Duration::from_secs(5));
    }

    #[test]
    fn test_attempt_bookkeeping() {
        let mut ctx = context(HeaderMap::new());
        assert!(ctx.last_failure().is_none());

        ctx.begin_attempt("books-0", Duration::from_secs(1));
        ctx.finish_attempt(AttemptOutcome::Failed(Failure::new(
            FailureReason::ConnectFailed,
            "books-0",
            "refused",
            Duration::from_millis(3),
        )));
        ctx.begin_attempt("books-1", Duration::from_secs(1));
        ctx.finish_attempt(AttemptOutcome::Success);

        assert_eq!(ctx.attempt_count(), 2);
        assert_eq!(ctx.last_failure().map(|f| f.instance_id.as_str()), Some("books-0"));
    }
}
