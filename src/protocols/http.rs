//! # HTTP Proxy Engine
//!
//! Forwards one attempt of an inbound request to one upstream instance.
//!
//! This module handles:
//! - Outbound HTTP/1.1 over a pooled `hyper-util` client
//! - Path rewriting (done by the route, applied here)
//! - Hop-by-hop header removal and `x-forwarded-*` headers
//! - Per-attempt timeouts covering connect and response headers
//! - Failure classification into [`FailureReason`]
//!
//! A call returns as soon as the upstream's response headers arrive. From
//! that point the body is streamed through [`RelayBody`], which keeps the
//! instance's in-flight slot, cuts the stream off at the request deadline
//! and reports the final outcome to the health tracker.
//!
//! ## Rust Concepts Used
//!
//! - `Arc<T>` to share the client and health tracker across request tasks
//! - `tokio::time::timeout` drops the request future on expiry, which
//!   aborts the upstream connection
//! - Error source chains (`std::error::Error::source`) to find the root cause

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, Response, Version};
use bytes::Bytes;
use http_body_util::Full;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::core::config::ProxyConfig;
use crate::core::types::{
    Failure, FailureReason, RequestContext, REQUEST_ID_HEADER, UPSTREAM_INSTANCE_HEADER,
};
use crate::discovery::registry::UpstreamInstance;
use crate::observability::health::HealthTracker;
use crate::protocols::body::RelayBody;

/// Headers that only apply to a single connection
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Pooled outbound client type
pub type UpstreamClient = Client<HttpConnector, Full<Bytes>>;

/// Proxy engine shared by all request tasks
pub struct HttpProxy {
    client: UpstreamClient,
    tracker: Arc<HealthTracker>,
    change_origin: bool,
}

impl HttpProxy {
    pub fn new(config: &ProxyConfig, tracker: Arc<HealthTracker>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout));
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build(connector);

        Self {
            client,
            tracker,
            change_origin: config.change_origin,
        }
    }

    pub fn tracker(&self) -> &Arc<HealthTracker> {
        &self.tracker
    }

    /// Forward `ctx` to `instance` as `path_and_query`
    ///
    /// On success the response headers have been received and the body is
    /// streaming. On failure the outcome has already been reported to the
    /// health tracker and the in-flight slot released.
    #[instrument(
        name = "proxy_attempt",
        skip_all,
        fields(request_id = %ctx.request_id, instance = %instance.id(), timeout_ms = attempt_timeout.as_millis() as u64)
    )]
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        path_and_query: &str,
        instance: &Arc<UpstreamInstance>,
        attempt_timeout: Duration,
    ) -> Result<Response<Body>, Failure> {
        let started = Instant::now();

        let uri = instance.uri_for(path_and_query).map_err(|e| {
            // Never the instance's fault, so health is left alone
            Failure::new(FailureReason::ProtocolError, instance.id(), e.to_string(), started.elapsed())
        })?;

        let mut request = Request::builder()
            .method(ctx.method.clone())
            .uri(uri)
            .version(Version::HTTP_11)
            .body(Full::new(ctx.body.clone()))
            .map_err(|e| {
                Failure::new(FailureReason::ProtocolError, instance.id(), e.to_string(), started.elapsed())
            })?;
        *request.headers_mut() = self.outbound_headers(ctx, instance);

        let guard = instance.begin_request();

        let result = timeout(attempt_timeout, self.client.request(request)).await;
        let elapsed = started.elapsed();

        let failure = match result {
            Ok(Ok(response)) => {
                debug!(
                    status = response.status().as_u16(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Upstream response headers received"
                );

                let (mut parts, incoming) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
                    parts.headers.insert(REQUEST_ID_HEADER, value);
                }
                if let Ok(value) = HeaderValue::from_str(instance.id()) {
                    parts.headers.insert(UPSTREAM_INSTANCE_HEADER, value);
                }

                let body = RelayBody::new(
                    incoming,
                    guard,
                    Arc::clone(&self.tracker),
                    ctx.request_id.clone(),
                    ctx.deadline,
                );
                return Ok(Response::from_parts(parts, Body::new(body)));
            }
            Ok(Err(error)) => {
                let reason = classify_error(&error);
                Failure::new(reason, instance.id(), describe_error(&error), elapsed)
            }
            Err(_) => Failure::new(
                FailureReason::Timeout,
                instance.id(),
                format!("no response headers within {:?}", attempt_timeout),
                elapsed,
            ),
        };

        // Release the slot before the retry controller looks at the group again
        drop(guard);

        warn!(
            reason = %failure.reason,
            elapsed_ms = elapsed.as_millis() as u64,
            detail = %failure.message,
            "Upstream attempt failed"
        );
        self.tracker.record_failure(instance, failure.reason);

        Err(failure)
    }

    /// Request headers as sent to the upstream
    fn outbound_headers(&self, ctx: &RequestContext, instance: &UpstreamInstance) -> HeaderMap {
        let mut headers = ctx.headers.clone();
        strip_hop_by_hop(&mut headers);

        let original_host = ctx
            .headers
            .get(header::HOST)
            .cloned()
            .or_else(|| {
                ctx.uri
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });

        if self.change_origin {
            if let Ok(value) = HeaderValue::from_str(instance.authority().as_str()) {
                headers.insert(header::HOST, value);
            }
        } else if let Some(host) = &original_host {
            headers.insert(header::HOST, host.clone());
        }

        if let Some(remote) = ctx.remote_addr {
            let client_ip = remote.ip().to_string();
            let forwarded_for = match headers
                .get(X_FORWARDED_FOR)
                .and_then(|v| v.to_str().ok())
            {
                Some(existing) => format!("{}, {}", existing, client_ip),
                None => client_ip,
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }

        if !headers.contains_key(X_FORWARDED_PROTO) {
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
        }
        if let Some(host) = original_host {
            if !headers.contains_key(X_FORWARDED_HOST) {
                headers.insert(X_FORWARDED_HOST, host);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }

        // The body was collected, so its length is known exactly
        if !ctx.body.is_empty() || headers.contains_key(header::CONTENT_LENGTH) {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(ctx.body.len()));
        }

        headers
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Map a client error to the reason reported to health and retry
pub fn classify_error(error: &hyper_util::client::legacy::Error) -> FailureReason {
    if error.is_connect() {
        return FailureReason::ConnectFailed;
    }

    let mut source = error.source();
    while let Some(cause) = source {
        if let Some(hyper_error) = cause.downcast_ref::<hyper::Error>() {
            if hyper_error.is_parse() || hyper_error.is_parse_status() {
                return FailureReason::ProtocolError;
            }
            if hyper_error.is_timeout() {
                return FailureReason::Timeout;
            }
        }
        if let Some(io_error) = cause.downcast_ref::<std::io::Error>() {
            if io_error.kind() == std::io::ErrorKind::TimedOut {
                return FailureReason::Timeout;
            }
        }
        source = cause.source();
    }

    FailureReason::UpstreamReset
}

/// Flatten an error chain into one line for logs
fn describe_error(error: &(dyn StdError + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-secret"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-secret", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[test]
    fn test_describe_error_includes_causes() {
        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let outer = std::io::Error::new(std::io::ErrorKind::Other, inner);
        assert!(describe_error(&outer).contains("refused"));
    }
}
