//! Streaming relay of upstream response bodies.
//!
//! [`RelayBody`] passes frames from the upstream connection to the caller
//! one at a time, so memory use per response is bounded by a single frame.
//! It owns the instance's in-flight slot until the body ends, the caller
//! goes away or the request deadline passes, and reports how the stream
//! ended to the health tracker.

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use hyper::body::Incoming;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use thiserror::Error;
use tokio::time::{sleep_until, Instant, Sleep};
use tracing::{debug, warn};

use crate::core::types::FailureReason;
use crate::discovery::registry::InFlightGuard;
use crate::observability::health::HealthTracker;

/// Why a relayed body ended early
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("upstream body failed: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("response body not finished within the request deadline")]
    DeadlineExceeded,
}

/// Ties the end of a response stream to the health tracker
struct Completion {
    guard: InFlightGuard,
    tracker: Arc<HealthTracker>,
    request_id: String,
    settled: bool,
}

impl Completion {
    fn succeed(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        self.tracker.record_success(self.guard.instance());
    }

    fn fail(&mut self, reason: FailureReason, error: &RelayError) {
        if self.settled {
            return;
        }
        self.settled = true;
        // Headers already went out; the caller sees a truncated body and
        // the request is never retried
        warn!(
            request_id = %self.request_id,
            instance = %self.guard.instance().id(),
            reason = %reason,
            error = %error,
            "Upstream failed while streaming response body"
        );
        self.tracker.record_failure(self.guard.instance(), reason);
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.settled {
            debug!(
                request_id = %self.request_id,
                instance = %self.guard.instance().id(),
                "Response body dropped before completion"
            );
        }
    }
}

pin_project! {
    /// Upstream response body relayed to the caller frame by frame
    pub struct RelayBody {
        #[pin]
        inner: Incoming,
        #[pin]
        deadline: Sleep,
        completion: Completion,
        finished: bool,
    }
}

impl RelayBody {
    pub fn new(
        inner: Incoming,
        guard: InFlightGuard,
        tracker: Arc<HealthTracker>,
        request_id: String,
        deadline: Instant,
    ) -> Self {
        let mut completion = Completion {
            guard,
            tracker,
            request_id,
            settled: false,
        };

        // Empty bodies may never be polled
        if inner.is_end_stream() {
            completion.succeed();
        }

        Self {
            inner,
            deadline: sleep_until(deadline),
            completion,
            finished: false,
        }
    }
}

impl Body for RelayBody {
    type Data = Bytes;
    type Error = RelayError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        if *this.finished {
            return Poll::Ready(None);
        }

        let polled = match this.inner.as_mut().poll_frame(cx) {
            Poll::Ready(polled) => polled,
            Poll::Pending => {
                ready!(this.deadline.as_mut().poll(cx));
                *this.finished = true;
                let error = RelayError::DeadlineExceeded;
                this.completion.fail(FailureReason::Timeout, &error);
                return Poll::Ready(Some(Err(error)));
            }
        };

        match polled {
            Some(Ok(frame)) => {
                // The server stops polling once the body reports its end
                if this.inner.is_end_stream() {
                    this.completion.succeed();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(error)) => {
                *this.finished = true;
                let error = RelayError::from(error);
                this.completion.fail(FailureReason::UpstreamReset, &error);
                Poll::Ready(Some(Err(error)))
            }
            None => {
                *this.finished = true;
                this.completion.succeed();
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
