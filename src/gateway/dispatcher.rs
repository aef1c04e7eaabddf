//! # Request Dispatcher
//!
//! Drives one routed request through pick, forward and retry until it either
//! produces a response or runs out of attempts or deadline.
//!
//! ```text
//!            +---------+   pick ok    +------------+  headers  +-----------+
//!  start --> | Picking | -----------> | Attempting | --------> | Streaming |
//!            +---------+              +------------+           +-----------+
//!                 ^  | exhausted           | failure
//!                 |  v                     v
//!                 | error            +----------+  give up
//!                 +----------------- | Retrying | ---------> error
//!                     after backoff  +----------+
//! ```
//!
//! Once response headers are received the request is committed to that
//! instance and is never retried.

use axum::body::Body;
use axum::http::Response;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{AttemptOutcome, FailureReason, RequestContext};
use crate::discovery::registry::UpstreamRegistry;
use crate::load_balancing::balancer::LoadBalancer;
use crate::observability::metrics;
use crate::protocols::http::HttpProxy;
use crate::routing::router::Route;
use crate::traffic::retry::{RetryDecision, RetryPolicy};

/// Ties selection, forwarding and retry together for one request at a time
pub struct Dispatcher {
    registry: Arc<UpstreamRegistry>,
    balancer: Arc<dyn LoadBalancer>,
    proxy: Arc<HttpProxy>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<UpstreamRegistry>,
        balancer: Arc<dyn LoadBalancer>,
        proxy: Arc<HttpProxy>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            balancer,
            proxy,
            retry,
        }
    }

    pub fn balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.balancer
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Forward `ctx` along `route`, retrying on another instance when safe
    pub async fn dispatch(
        &self,
        route: &Route,
        ctx: &mut RequestContext,
    ) -> GatewayResult<Response<Body>> {
        let group = self.registry.group(route.group).ok_or_else(|| {
            GatewayError::internal(format!("Route {} points at a missing group", route.pattern))
        })?;
        let path_and_query = route.rewrite(&ctx.uri);

        loop {
            let remaining = ctx.remaining();
            if remaining.is_zero() {
                let instance = ctx.last_failure().map(|f| f.instance_id.clone());
                return Err(self.retry.deadline_exceeded(ctx, instance.as_deref()));
            }

            let instance = match self.balancer.pick(group, &ctx.excluded) {
                Ok(instance) => instance,
                Err(exhausted) => {
                    // A retry that finds nothing left reports why the last attempt failed
                    return Err(match ctx.last_failure() {
                        Some(failure) => GatewayError::from_failure(failure),
                        None => {
                            metrics::record_rejected("exhausted");
                            warn!(
                                request_id = %ctx.request_id,
                                group = %group.name(),
                                "No healthy or suspect instance available"
                            );
                            exhausted
                        }
                    });
                }
            };

            let attempt_timeout = self.retry.attempt_timeout(remaining);
            let deadline_bound = self.retry.bounded_by_deadline(remaining);

            ctx.begin_attempt(instance.id(), attempt_timeout);
            debug!(
                request_id = %ctx.request_id,
                attempt = ctx.attempt_count(),
                instance = %instance.id(),
                upstream_path = %path_and_query,
                "Forwarding request"
            );

            match self
                .proxy
                .forward(ctx, &path_and_query, &instance, attempt_timeout)
                .await
            {
                Ok(response) => {
                    ctx.finish_attempt(AttemptOutcome::Success);
                    metrics::record_upstream_attempt(group.name(), "success");
                    if ctx.retry_count > 0 {
                        info!(
                            request_id = %ctx.request_id,
                            instance = %instance.id(),
                            retries = ctx.retry_count,
                            "Request succeeded after retry"
                        );
                    }
                    return Ok(response);
                }
                Err(failure) => {
                    metrics::record_upstream_attempt(group.name(), failure.reason.code());
                    ctx.finish_attempt(AttemptOutcome::Failed(failure.clone()));

                    if failure.reason == FailureReason::Timeout && deadline_bound {
                        return Err(self.retry.deadline_exceeded(ctx, Some(&failure.instance_id)));
                    }

                    match self.retry.decide(ctx, &failure) {
                        RetryDecision::Retry { backoff, exclude } => {
                            ctx.excluded = exclude;
                            ctx.retry_count += 1;
                            metrics::record_retry(group.name());
                            debug!(
                                request_id = %ctx.request_id,
                                failed_instance = %failure.instance_id,
                                reason = %failure.reason,
                                backoff_ms = backoff.as_millis() as u64,
                                "Retrying on another instance"
                            );
                            tokio::time::sleep(backoff).await;
                        }
                        RetryDecision::GiveUp(error) => return Err(error),
                    }
                }
            }
        }
    }
}
