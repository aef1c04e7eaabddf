//! # HTTP Server Module
//!
//! This module wires the gateway together and serves it with Axum.
//! It accepts inbound requests, resolves their route, enforces admission and
//! size limits, and hands them to the [`Dispatcher`] for forwarding.
//!
//! Two listeners are bound:
//! - the proxy listener, where every path is handled by [`handle_request`]
//! - the admin listener, serving upstream status, gateway health and metrics
//!
//! ## Rust Concepts Used
//!
//! - `Arc<T>` for sharing gateway state across async tasks
//! - `tokio::net::TcpListener` for accepting incoming connections
//! - `CancellationToken` for coordinated graceful shutdown
//! - Tower middleware (`TraceLayer`, `CorsLayer`) around the proxy handler

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Router as AxumRouter,
};
use http_body_util::LengthLimitError;
use metrics_exporter_prometheus::PrometheusHandle;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowHeaders, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, instrument, warn};

use crate::admin::status::StatusAdminRouter;
use crate::core::config::{CorsConfig, GatewayConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{request_id_from, RequestContext, REQUEST_ID_HEADER};
use crate::discovery::registry::UpstreamRegistry;
use crate::gateway::dispatcher::Dispatcher;
use crate::load_balancing::balancer::LeastInFlightBalancer;
use crate::observability::health::HealthTracker;
use crate::observability::metrics;
use crate::protocols::http::HttpProxy;
use crate::routing::router::{Route, RouteTable};
use crate::traffic::limiter::{ConcurrencyLimiter, PermitBody};
use crate::traffic::retry::RetryPolicy;

/// Request handling settings fixed at startup
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub max_request_size: usize,
    pub banner: Option<String>,
    pub expose_upstream_addresses: bool,
    pub request_deadline: Duration,
}

/// Shared state for the proxy and admin handlers
#[derive(Clone)]
pub struct GatewayState {
    pub routes: Arc<RouteTable>,
    pub registry: Arc<UpstreamRegistry>,
    pub tracker: Arc<HealthTracker>,
    pub dispatcher: Arc<Dispatcher>,
    pub limiter: ConcurrencyLimiter,
    pub settings: Arc<GatewaySettings>,
    /// Present when the Prometheus recorder was installed
    pub metrics: Option<PrometheusHandle>,
    pub started_at: Instant,
}

/// A fully assembled gateway, not yet bound to any socket
pub struct Gateway {
    config: GatewayConfig,
    state: GatewayState,
}

impl Gateway {
    /// Validate `config` and build every component from it
    pub fn from_config(config: GatewayConfig) -> GatewayResult<Self> {
        config.validate()?;

        let registry = Arc::new(UpstreamRegistry::from_config(&config.upstreams)?);
        let routes = Arc::new(RouteTable::from_config(&config.routes, &registry)?);
        let tracker = Arc::new(HealthTracker::new(Arc::clone(&registry), &config.health_check)?);
        let proxy = Arc::new(HttpProxy::new(&config.proxy, Arc::clone(&tracker)));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::new(LeastInFlightBalancer::new()),
            proxy,
            RetryPolicy::new(config.retry.clone()),
        ));

        let settings = GatewaySettings {
            max_request_size: config.server.max_request_size,
            banner: config.server.banner.clone(),
            expose_upstream_addresses: config.server.expose_upstream_addresses,
            request_deadline: config.retry.request_deadline,
        };

        info!(
            routes = routes.len(),
            upstream_groups = registry.groups().len(),
            instances = registry.instances().count(),
            max_concurrent_requests = config.server.max_concurrent_requests,
            "Gateway configured"
        );

        let state = GatewayState {
            routes,
            registry,
            tracker,
            dispatcher,
            limiter: ConcurrencyLimiter::new(config.server.max_concurrent_requests),
            settings: Arc::new(settings),
            metrics: None,
            started_at: Instant::now(),
        };

        Ok(Self { config, state })
    }

    /// Serve `/metrics` from this handle on the admin listener
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    pub fn tracker(&self) -> &Arc<HealthTracker> {
        &self.state.tracker
    }

    pub fn registry(&self) -> &Arc<UpstreamRegistry> {
        &self.state.registry
    }

    /// Router for the proxy listener
    pub fn proxy_router(&self) -> AxumRouter {
        let mut app = AxumRouter::new()
            .fallback(handle_request)
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http());

        if let Some(cors) = build_cors(&self.config.cors) {
            app = app.layer(cors);
            info!(
                "CORS enabled with {} allowed origins",
                self.config.cors.allowed_origins.len()
            );
        }

        app
    }

    /// Router for the admin listener
    pub fn admin_router(&self) -> AxumRouter {
        StatusAdminRouter::create_router(self.state.clone())
    }
}

/// Build the CORS layer, or `None` when CORS is disabled
fn build_cors(config: &CorsConfig) -> Option<CorsLayer> {
    if !config.enabled {
        return None;
    }

    let mut cors_layer = CorsLayer::new().allow_headers(AllowHeaders::mirror_request());

    if config.allowed_origins.iter().any(|o| o == "*") {
        cors_layer = cors_layer.allow_origin(Any);
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse::<HeaderValue>().ok())
            .collect();
        cors_layer = cors_layer.allow_origin(origins);
    }

    let methods: Vec<Method> = config
        .allowed_methods
        .iter()
        .filter_map(|m| m.parse().ok())
        .collect();
    cors_layer = cors_layer.allow_methods(methods);

    Some(cors_layer.allow_credentials(config.allow_credentials))
}

/// Gateway bound to its proxy and admin sockets
pub struct GatewayServer {
    gateway: Gateway,
    proxy_listener: TcpListener,
    admin_listener: TcpListener,
}

impl GatewayServer {
    /// Bind both listeners from the configured addresses
    pub async fn bind(gateway: Gateway) -> GatewayResult<Self> {
        let proxy_addr = gateway.config.server.bind_address.clone();
        let admin_addr = gateway.config.server.admin_bind_address.clone();

        let proxy_listener = TcpListener::bind(&proxy_addr).await.map_err(|e| {
            GatewayError::internal(format!("Failed to bind gateway server to {}: {}", proxy_addr, e))
        })?;

        let admin_listener = TcpListener::bind(&admin_addr).await.map_err(|e| {
            GatewayError::internal(format!("Failed to bind admin server to {}: {}", admin_addr, e))
        })?;

        Ok(Self {
            gateway,
            proxy_listener,
            admin_listener,
        })
    }

    /// Actual proxy address, useful when bound to port 0
    pub fn local_addr(&self) -> GatewayResult<SocketAddr> {
        Ok(self.proxy_listener.local_addr()?)
    }

    pub fn admin_local_addr(&self) -> GatewayResult<SocketAddr> {
        Ok(self.admin_listener.local_addr()?)
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Serve until `shutdown` is cancelled, then drain in-flight requests
    pub async fn run(self, shutdown: CancellationToken) -> GatewayResult<()> {
        let proxy_addr = self.local_addr()?;
        let admin_addr = self.admin_local_addr()?;
        let GatewayServer {
            gateway,
            proxy_listener,
            admin_listener,
        } = self;

        let probing = Arc::clone(&gateway.state.tracker).spawn_probing(shutdown.child_token());

        let proxy_app = gateway
            .proxy_router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let admin_app = gateway.admin_router();

        info!("Gateway HTTP server listening on {}", proxy_addr);
        info!("Admin HTTP server listening on {}", admin_addr);

        let proxy_token = shutdown.clone();
        let proxy_server = async move {
            axum::serve(proxy_listener, proxy_app)
                .with_graceful_shutdown(async move { proxy_token.cancelled().await })
                .await
                .map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)))
        };

        let admin_token = shutdown.clone();
        let admin_server = async move {
            axum::serve(admin_listener, admin_app)
                .with_graceful_shutdown(async move { admin_token.cancelled().await })
                .await
                .map_err(|e| GatewayError::internal(format!("Admin server error: {}", e)))
        };

        let result = tokio::try_join!(proxy_server, admin_server).map(|_| ());

        // One listener failing takes the rest of the gateway down with it
        shutdown.cancel();
        if let Some(handle) = probing {
            if let Err(e) = handle.await {
                warn!("Health probe task ended abnormally: {}", e);
            }
        }

        info!("Gateway stopped");
        result
    }
}

/// Main request handler for every path on the proxy listener
#[instrument(skip(state, request), fields(request_id, method, path))]
async fn handle_request(State(state): State<GatewayState>, request: Request) -> Response {
    let start_time = Instant::now();

    let (mut parts, body) = request.into_parts();
    let request_id = request_id_from(&parts.headers);
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        parts.headers.insert(REQUEST_ID_HEADER, value);
    }

    tracing::Span::current()
        .record("request_id", request_id.as_str())
        .record("method", parts.method.as_str())
        .record("path", parts.uri.path());

    let Some(route) = state.routes.match_path(parts.uri.path()).cloned() else {
        if parts.method == Method::GET && parts.uri.path() == "/" {
            if let Some(banner) = &state.settings.banner {
                return (StatusCode::OK, banner.clone()).into_response();
            }
        }

        debug!(method = %parts.method, path = %parts.uri.path(), "No route matched");
        metrics::record_rejected("no_route");
        let error = GatewayError::route_not_found(parts.method.as_str(), parts.uri.path());
        metrics::record_request("unmatched", error.status_code().as_u16(), start_time.elapsed());
        return error_response(&state, error, &request_id, None);
    };

    let permit = match state.limiter.try_acquire() {
        Ok(permit) => permit,
        Err(error) => {
            warn!(limit = state.limiter.limit(), "Concurrency limit reached, shedding request");
            metrics::record_rejected("overloaded");
            metrics::record_request(&route.pattern, error.status_code().as_u16(), start_time.elapsed());
            return error_response(&state, error, &request_id, Some(&route));
        }
    };

    let max_size = state.settings.max_request_size;
    let declared_length = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let body_bytes = if declared_length.map_or(false, |len| len > max_size as u64) {
        Err(GatewayError::PayloadTooLarge { limit: max_size })
    } else {
        axum::body::to_bytes(body, max_size).await.map_err(|e| {
            if is_length_limit(&e) {
                GatewayError::PayloadTooLarge { limit: max_size }
            } else {
                GatewayError::BadRequest {
                    message: e.to_string(),
                }
            }
        })
    };

    let body_bytes = match body_bytes {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!(max_size, "Failed to read request body: {}", error);
            metrics::record_rejected(error.error_type());
            metrics::record_request(&route.pattern, error.status_code().as_u16(), start_time.elapsed());
            return error_response(&state, error, &request_id, Some(&route));
        }
    };

    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let mut ctx = RequestContext::new(
        parts.method,
        parts.uri,
        parts.version,
        parts.headers,
        body_bytes,
        remote_addr,
        state.settings.request_deadline,
    );

    debug!(
        route = %route.pattern,
        upstream = %route.upstream,
        body_size = ctx.body.len(),
        remote_addr = ?remote_addr,
        "Processing incoming request"
    );

    let response = match state.dispatcher.dispatch(&route, &mut ctx).await {
        Ok(response) => response.map(|body| Body::new(PermitBody::new(body, permit))),
        Err(error) => {
            warn!(
                route = %route.pattern,
                attempts = ctx.attempt_count(),
                error_type = error.error_type(),
                "Request failed: {}",
                error
            );
            error_response(&state, error, &ctx.request_id, Some(&route))
        }
    };

    metrics::record_request(&route.pattern, response.status().as_u16(), start_time.elapsed());
    response
}

/// Structured error response carrying the request id
fn error_response(
    state: &GatewayState,
    error: GatewayError,
    request_id: &str,
    route: Option<&Route>,
) -> Response {
    let message = route
        .filter(|_| error.status_code() == StatusCode::BAD_GATEWAY)
        .and_then(|route| route.error_message.as_deref());

    let upstream = if state.settings.expose_upstream_addresses {
        error
            .instance()
            .and_then(|id| state.registry.find_instance(id))
            .map(|instance| instance.address().to_string())
    } else {
        None
    };

    let mut response = error.into_response_with(Some(request_id), message, upstream.as_deref());
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Whether a body read failed because it hit the size limit
fn is_length_limit(error: &axum::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(cause) = source {
        if cause.is::<LengthLimitError>() {
            return true;
        }
        source = cause.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{HealthCheckConfig, RouteDefinition, UpstreamConfig};
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.health_check = HealthCheckConfig {
            enabled: false,
            ..HealthCheckConfig::default()
        };
        config.server.banner = Some("API Gateway rodando!".to_string());
        config.server.max_request_size = 16;
        config.upstreams.insert(
            "books".to_string(),
            UpstreamConfig {
                endpoints: vec!["http://127.0.0.1:1".to_string()],
            },
        );
        config.routes.push(RouteDefinition {
            pattern: "/books".to_string(),
            upstream: "books".to_string(),
            strip_prefix: false,
            upstream_prefix: None,
            error_message: Some("Catalogue unavailable".to_string()),
        });
        config
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_banner_on_root() {
        let gateway = Gateway::from_config(test_config()).unwrap();
        let response = gateway
            .proxy_router()
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"API Gateway rodando!");
    }

    #[tokio::test]
    async fn test_unknown_path_is_404_with_request_id() {
        let gateway = Gateway::from_config(test_config()).unwrap();
        let response = gateway
            .proxy_router()
            .oneshot(
                HttpRequest::get("/loans/1")
                    .header(REQUEST_ID_HEADER, "req-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-42");
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "route_not_found");
        assert_eq!(body["error"]["request_id"], "req-42");
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let gateway = Gateway::from_config(test_config()).unwrap();
        let response = gateway
            .proxy_router()
            .oneshot(
                HttpRequest::post("/books")
                    .body(Body::from(vec![b'x'; 64]))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body_json(response).await["error"]["type"], "payload_too_large");
    }

    #[tokio::test]
    async fn test_route_error_message_replaces_upstream_failure_text() {
        let gateway = Gateway::from_config(test_config()).unwrap();
        let response = gateway
            .proxy_router()
            .oneshot(HttpRequest::get("/books/1").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["error"]["message"], "Catalogue unavailable");
        assert_eq!(body["error"]["instance"], "books-0");
        assert!(body["error"].get("upstream").is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.routes[0].upstream = "missing".to_string();
        assert!(matches!(
            Gateway::from_config(config),
            Err(GatewayError::Configuration { .. })
        ));
    }
}
