//! # Health Tracking
//!
//! Per-instance liveness derived from two sources: periodic active probes
//! and the outcome of live proxied requests. Both feed one state machine.
//!
//! ```text
//!            N live failures / 1 probe failure
//!   Healthy ----------------------------------> Suspect
//!      ^                                          |  ^
//!      |  recovery_threshold successes            |  |  successful probe
//!      +------------------------------------------+  |
//!                      M live / K probe failures  v  |
//!                                              Unhealthy
//! ```
//!
//! ## Key Features
//! - Probe failures and live failures share one consecutive counter, so the
//!   same outage is never counted twice against different thresholds
//! - Entering a state resets the counters
//! - Unhealthy instances keep being probed so they can recover
//! - Transitions are logged, counted and broadcast; they never fail a request
//!
//! ## Rust Concepts Used
//! - `parking_lot::Mutex` guards each instance's record; the lock is held
//!   only for the state update and released before logging or broadcasting
//! - `tokio::sync::broadcast` for transition events
//! - `async_trait` so probe implementations can be swapped in tests
//! - `CancellationToken` to stop the probe loop on shutdown

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::HealthCheckConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::FailureReason;
use crate::discovery::registry::{UpstreamInstance, UpstreamRegistry};
use crate::observability::metrics;

/// Liveness of one upstream instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Preferred for selection
    Healthy,
    /// Recently failing, selected only when no Healthy instance is left
    Suspect,
    /// Never selected, probed until it recovers
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Suspect => "suspect",
            HealthState::Unhealthy => "unhealthy",
        }
    }

    pub fn is_selectable(&self) -> bool {
        !matches!(self, HealthState::Unhealthy)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an outcome came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeSource {
    /// A proxied request
    Live,
    /// An active health probe
    Probe,
}

/// Thresholds driving the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    /// Live failures moving Healthy to Suspect (N)
    pub failure_threshold: u32,
    /// Live failures moving Suspect to Unhealthy (M)
    pub suspect_failure_threshold: u32,
    /// Probe failures moving Suspect to Unhealthy (K)
    pub probe_failure_threshold: u32,
    /// Successes moving Suspect to Healthy
    pub recovery_threshold: u32,
    /// Whether a probe loop runs. Without one nothing brings an Unhealthy
    /// instance back, so live failures stop at Suspect.
    pub probing: bool,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from(&HealthCheckConfig::default())
    }
}

impl From<&HealthCheckConfig> for HealthPolicy {
    fn from(config: &HealthCheckConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            suspect_failure_threshold: config.suspect_failure_threshold.max(1),
            probe_failure_threshold: config.probe_failure_threshold.max(1),
            recovery_threshold: config.recovery_threshold.max(1),
            probing: config.enabled,
        }
    }
}

/// A state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
}

/// Health fields of one instance
#[derive(Debug, Clone, PartialEq)]
pub struct HealthRecord {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_probe: Option<DateTime<Utc>>,
    pub last_transition: Option<DateTime<Utc>>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRecord {
    /// New instances start Healthy
    pub fn new() -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_probe: None,
            last_transition: None,
        }
    }

    /// Feed one outcome into the state machine
    ///
    /// Returns the transition if the state changed.
    pub fn apply(
        &mut self,
        policy: &HealthPolicy,
        source: OutcomeSource,
        success: bool,
    ) -> Option<Transition> {
        let next = match (self.state, success) {
            (HealthState::Healthy, true) => {
                self.consecutive_failures = 0;
                None
            }
            (HealthState::Healthy, false) => {
                self.consecutive_failures += 1;
                match source {
                    OutcomeSource::Probe => Some(HealthState::Suspect),
                    OutcomeSource::Live if self.consecutive_failures >= policy.failure_threshold => {
                        Some(HealthState::Suspect)
                    }
                    OutcomeSource::Live => None,
                }
            }
            (HealthState::Suspect, true) => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
                (self.consecutive_successes >= policy.recovery_threshold)
                    .then_some(HealthState::Healthy)
            }
            (HealthState::Suspect, false) => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
                let threshold = match source {
                    OutcomeSource::Live if !policy.probing => return None,
                    OutcomeSource::Live => policy.suspect_failure_threshold,
                    OutcomeSource::Probe => policy.probe_failure_threshold,
                };
                (self.consecutive_failures >= threshold).then_some(HealthState::Unhealthy)
            }
            // Only a probe may bring an Unhealthy instance back
            (HealthState::Unhealthy, true) => {
                (source == OutcomeSource::Probe).then_some(HealthState::Suspect)
            }
            (HealthState::Unhealthy, false) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                None
            }
        };

        next.map(|to| self.enter(to))
    }

    fn enter(&mut self, to: HealthState) -> Transition {
        let from = self.state;
        self.state = to;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.last_transition = Some(Utc::now());
        Transition { from, to }
    }
}

/// Health event types
#[derive(Debug, Clone)]
pub enum HealthEvent {
    /// An instance changed state
    StateChanged {
        instance_id: String,
        group: String,
        from: HealthState,
        to: HealthState,
        source: OutcomeSource,
    },
}

/// Type aliases for health event channels
pub type HealthEventSender = broadcast::Sender<HealthEvent>;
pub type HealthEventReceiver = broadcast::Receiver<HealthEvent>;

/// Result of a single probe
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub healthy: bool,
    pub duration: Duration,
    pub message: Option<String>,
}

impl ProbeResult {
    pub fn success(duration: Duration) -> Self {
        Self {
            healthy: true,
            duration,
            message: None,
        }
    }

    pub fn failure<S: Into<String>>(message: S, duration: Duration) -> Self {
        Self {
            healthy: false,
            duration,
            message: Some(message.into()),
        }
    }
}

/// Health probe trait for different probe implementations
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe `instance` at `path`, giving up after `timeout`
    async fn check(&self, instance: &UpstreamInstance, path: &str, timeout: Duration) -> ProbeResult;

    /// Get the probe type name
    fn probe_type(&self) -> &'static str;
}

/// HTTP GET probe
pub struct HttpHealthProbe {
    client: HttpClient,
}

impl HttpHealthProbe {
    pub fn new() -> GatewayResult<Self> {
        // 3xx answers count as alive, so they must not be followed
        let client = HttpClient::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| GatewayError::internal(format!("Failed to create probe client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, instance: &UpstreamInstance, path: &str, probe_timeout: Duration) -> ProbeResult {
        let started = Instant::now();
        let url = instance.probe_url(path);

        match timeout(probe_timeout, self.client.get(&url).send()).await {
            Ok(Ok(response)) => {
                let status = response.status();
                if status.is_success() || status.is_redirection() {
                    ProbeResult::success(started.elapsed())
                } else {
                    ProbeResult::failure(format!("Unexpected status code: {}", status.as_u16()), started.elapsed())
                }
            }
            Ok(Err(e)) => ProbeResult::failure(format!("Probe request failed: {}", e), started.elapsed()),
            Err(_) => ProbeResult::failure(
                format!("Probe timed out after {:?}", probe_timeout),
                started.elapsed(),
            ),
        }
    }

    fn probe_type(&self) -> &'static str {
        "http"
    }
}

/// Owns the health state machine for every registered instance
pub struct HealthTracker {
    registry: Arc<UpstreamRegistry>,
    policy: HealthPolicy,
    config: HealthCheckConfig,
    probe: Arc<dyn HealthProbe>,
    event_sender: HealthEventSender,
}

impl HealthTracker {
    /// Create a tracker that probes over HTTP
    pub fn new(registry: Arc<UpstreamRegistry>, config: &HealthCheckConfig) -> GatewayResult<Self> {
        let probe = Arc::new(HttpHealthProbe::new()?);
        Ok(Self::with_probe(registry, config, probe))
    }

    /// Create a tracker with a custom probe implementation
    pub fn with_probe(
        registry: Arc<UpstreamRegistry>,
        config: &HealthCheckConfig,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(256);
        Self {
            registry,
            policy: HealthPolicy::from(config),
            config: config.clone(),
            probe,
            event_sender,
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    pub fn registry(&self) -> &Arc<UpstreamRegistry> {
        &self.registry
    }

    /// Subscribe to health events
    pub fn subscribe(&self) -> HealthEventReceiver {
        self.event_sender.subscribe()
    }

    /// A live request against `instance` completed
    pub fn record_success(&self, instance: &UpstreamInstance) {
        self.apply(instance, OutcomeSource::Live, true);
    }

    /// A live request against `instance` failed
    pub fn record_failure(&self, instance: &UpstreamInstance, reason: FailureReason) {
        debug!(instance = %instance.id(), reason = %reason, "Live request failure recorded");
        self.apply(instance, OutcomeSource::Live, false);
    }

    /// A probe against `instance` finished
    pub fn record_probe(&self, instance: &UpstreamInstance, result: &ProbeResult) {
        {
            instance.health.lock().last_probe = Some(Utc::now());
        }
        metrics::record_probe(instance.group(), result.healthy);
        if let Some(message) = &result.message {
            debug!(instance = %instance.id(), message = %message, "Health probe failed");
        }
        self.apply(instance, OutcomeSource::Probe, result.healthy);
    }

    fn apply(&self, instance: &UpstreamInstance, source: OutcomeSource, success: bool) {
        let transition = instance.health.lock().apply(&self.policy, source, success);

        if let Some(Transition { from, to }) = transition {
            match to {
                HealthState::Healthy => info!(
                    instance = %instance.id(),
                    group = %instance.group(),
                    from = %from,
                    to = %to,
                    source = ?source,
                    "Upstream instance recovered"
                ),
                _ => warn!(
                    instance = %instance.id(),
                    group = %instance.group(),
                    from = %from,
                    to = %to,
                    source = ?source,
                    "Upstream instance health changed"
                ),
            }

            metrics::record_health_transition(instance.group(), to);

            // No receivers is fine
            let _ = self.event_sender.send(HealthEvent::StateChanged {
                instance_id: instance.id().to_string(),
                group: instance.group().to_string(),
                from,
                to,
                source,
            });
        }
    }

    /// Probe one instance and feed the result into its state machine
    pub async fn probe_instance(&self, instance: &UpstreamInstance) -> ProbeResult {
        let result = self
            .probe
            .check(instance, &self.config.path, self.config.timeout)
            .await;
        self.record_probe(instance, &result);
        result
    }

    /// Probe every instance concurrently
    pub async fn probe_all(&self) {
        let probes = self
            .registry
            .instances()
            .map(|instance| self.probe_instance(instance));
        let results = join_all(probes).await;

        let failed = results.iter().filter(|r| !r.healthy).count();
        debug!(probed = results.len(), failed, "Health probe round completed");
    }

    /// Start the periodic probe loop
    ///
    /// Returns `None` when probing is disabled. The loop exits when
    /// `shutdown` is cancelled.
    pub fn spawn_probing(self: Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            warn!("Active health probing disabled; live failures mark instances Suspect at most");
            return None;
        }

        info!(
            interval = ?self.config.interval,
            timeout = ?self.config.timeout,
            path = %self.config.path,
            probe = self.probe.probe_type(),
            "Starting active health probing"
        );

        let tracker = self;
        Some(tokio::spawn(async move {
            let mut ticker = interval(tracker.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tracker.probe_all() => {}
                        }
                    }
                }
            }

            info!("Active health probing stopped");
        }))
    }
}
