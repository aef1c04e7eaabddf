//! # Operator Status Endpoints
//!
//! Read-only endpoints served on the admin listener:
//! - `GET /admin/upstreams` - every group and instance with its health state
//! - `GET /health` - liveness of the gateway itself
//! - `GET /metrics` - Prometheus exposition, when the recorder is installed
//!
//! ## Security Note
//! The admin listener binds to loopback by default. Instance addresses are
//! only listed when `server.expose_upstream_addresses` is set.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::gateway::server::GatewayState;
use crate::load_balancing::balancer::LoadBalancerStats;
use crate::observability::health::HealthState;

/// Admin router for operator status
pub struct StatusAdminRouter;

impl StatusAdminRouter {
    pub fn create_router(state: GatewayState) -> Router {
        Router::new()
            .route("/admin/upstreams", get(list_upstreams))
            .route("/health", get(gateway_health))
            .route("/metrics", get(render_metrics))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }
}

// ============================================================================
// Response types
// ============================================================================

/// One instance as shown to operators
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub state: HealthState,
    pub in_flight: usize,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_probe: Option<DateTime<Utc>>,
    pub last_transition: Option<DateTime<Utc>>,
}

/// One upstream group as shown to operators
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub id: String,
    pub instances: Vec<InstanceStatus>,
}

#[derive(Debug, Serialize)]
pub struct GatewayHealthResponse {
    /// `healthy`, or `degraded` when some group has nothing selectable
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub requests_in_flight: usize,
    pub max_concurrent_requests: usize,
    pub degraded_groups: Vec<String>,
    pub load_balancer: LoadBalancerStats,
}

/// Snapshot of every group, in registration order
pub fn upstream_status(state: &GatewayState) -> Vec<GroupStatus> {
    let expose = state.settings.expose_upstream_addresses;

    state
        .registry
        .groups()
        .iter()
        .map(|group| GroupStatus {
            id: group.name().to_string(),
            instances: group
                .instances()
                .iter()
                .map(|instance| {
                    let health = instance.health_snapshot();
                    InstanceStatus {
                        id: instance.id().to_string(),
                        address: expose.then(|| instance.address().to_string()),
                        state: health.state,
                        in_flight: instance.in_flight(),
                        consecutive_failures: health.consecutive_failures,
                        consecutive_successes: health.consecutive_successes,
                        last_probe: health.last_probe,
                        last_transition: health.last_transition,
                    }
                })
                .collect(),
        })
        .collect()
}

// ============================================================================
// Handlers
// ============================================================================

async fn list_upstreams(State(state): State<GatewayState>) -> Json<Vec<GroupStatus>> {
    Json(upstream_status(&state))
}

async fn gateway_health(State(state): State<GatewayState>) -> Json<GatewayHealthResponse> {
    let degraded_groups: Vec<String> = state
        .registry
        .groups()
        .iter()
        .filter(|group| {
            !group
                .instances()
                .iter()
                .any(|instance| instance.health_state().is_selectable())
        })
        .map(|group| group.name().to_string())
        .collect();

    Json(GatewayHealthResponse {
        status: if degraded_groups.is_empty() {
            "healthy"
        } else {
            "degraded"
        },
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        requests_in_flight: state.limiter.in_use(),
        max_concurrent_requests: state.limiter.limit(),
        degraded_groups,
        load_balancer: state.dispatcher.balancer().stats(),
    })
}

async fn render_metrics(State(state): State<GatewayState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "Metrics are disabled").into_response(),
    }
}
