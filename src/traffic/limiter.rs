//! Admission control for proxied requests.
//!
//! A fixed number of permits bounds how many proxied requests the gateway
//! works on at once. A request that finds no free permit is shed with
//! `503 overloaded` instead of being queued. The permit travels with the
//! response body, so slow callers keep counting against the limit until
//! their response has been fully relayed.

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::error::{GatewayError, GatewayResult};

/// Non-queueing concurrency limiter
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Take a permit or fail immediately with `Overloaded`
    pub fn try_acquire(&self) -> GatewayResult<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map_err(|_| GatewayError::Overloaded { limit: self.limit })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Requests currently holding a permit
    pub fn in_use(&self) -> usize {
        self.limit.saturating_sub(self.semaphore.available_permits())
    }
}

pin_project! {
    /// Response body that releases its admission permit when dropped
    pub struct PermitBody<B> {
        #[pin]
        inner: B,
        _permit: OwnedSemaphorePermit,
    }
}

impl<B> PermitBody<B> {
    pub fn new(inner: B, permit: OwnedSemaphorePermit) -> Self {
        Self {
            inner,
            _permit: permit,
        }
    }
}

impl<B> Body for PermitBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.project().inner.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_sheds_when_full() {
        let limiter = ConcurrencyLimiter::new(2);
        let first = assert_ok!(limiter.try_acquire());
        let _second = assert_ok!(limiter.try_acquire());
        assert_eq!(limiter.in_use(), 2);

        let err = assert_err!(limiter.try_acquire());
        assert_eq!(err, GatewayError::Overloaded { limit: 2 });

        drop(first);
        assert_ok!(limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_permit_released_with_body() {
        let limiter = ConcurrencyLimiter::new(1);
        let permit = limiter.try_acquire().unwrap();
        let body = PermitBody::new(Full::new(Bytes::from_static(b"hello")), permit);
        assert_eq!(limiter.in_use(), 1);

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello");
        assert_eq!(limiter.in_use(), 0);
    }
}
