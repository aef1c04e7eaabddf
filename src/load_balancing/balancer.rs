//! # Load Balancer Module
//!
//! Chooses the upstream instance for each attempt.
//!
//! ## Rust Concepts Explained
//!
//! - `Arc<T>` lets the chosen instance outlive the borrow of its group
//! - `AtomicUsize` holds the round-robin cursor and the statistics, so
//!   selection never takes a lock
//! - `Send + Sync` on the trait so one balancer serves every request task
//!
//! ## Algorithm
//!
//! 1. Drop instances in the exclude-set (already tried for this request)
//! 2. Keep Healthy instances; if there are none, fall back to Suspect ones
//! 3. Pick the least in-flight instance, scanning from the position after the
//!    last pick so equal loads rotate round-robin
//! 4. No candidate left: `Exhausted`

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ExcludeSet;
use crate::discovery::registry::{UpstreamGroup, UpstreamInstance};
use crate::observability::health::HealthState;

/// Core trait for instance selection
pub trait LoadBalancer: Send + Sync {
    /// Select an instance from `group` that is not in `exclude`
    ///
    /// # Returns
    /// * `Ok(instance)` - the instance to attempt next
    /// * `Err(GatewayError::Exhausted)` - no selectable instance left
    fn pick(&self, group: &UpstreamGroup, exclude: &ExcludeSet) -> GatewayResult<Arc<UpstreamInstance>>;

    /// Get the algorithm name for metrics and logging
    fn algorithm_name(&self) -> &'static str;

    /// Get current statistics for this load balancer
    fn stats(&self) -> LoadBalancerStats;
}

/// Load balancer statistics for monitoring
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadBalancerStats {
    pub algorithm: String,
    /// Successful picks
    pub selections: u64,
    /// Picks that had to use a Suspect instance
    pub suspect_fallbacks: u64,
    /// Picks that found no candidate
    pub exhausted: u64,
}

/// Least in-flight selection with a Healthy-then-Suspect fallback
#[derive(Debug, Default)]
pub struct LeastInFlightBalancer {
    selections: AtomicU64,
    suspect_fallbacks: AtomicU64,
    exhausted: AtomicU64,
}

impl LeastInFlightBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the least loaded instance in `tier`, scanning from `start`
    fn least_loaded(
        instances: &[Arc<UpstreamInstance>],
        start: usize,
        tier: HealthState,
        exclude: &ExcludeSet,
    ) -> Option<usize> {
        let len = instances.len();
        let mut best: Option<(usize, usize)> = None;

        for offset in 0..len {
            let index = (start + offset) % len;
            let instance = &instances[index];
            if exclude.contains(instance.id()) || instance.health_state() != tier {
                continue;
            }

            let load = instance.in_flight();
            // Strict comparison keeps the earliest position on ties
            if best.map_or(true, |(_, best_load)| load < best_load) {
                best = Some((index, load));
            }
        }

        best.map(|(index, _)| index)
    }
}

impl LoadBalancer for LeastInFlightBalancer {
    fn pick(&self, group: &UpstreamGroup, exclude: &ExcludeSet) -> GatewayResult<Arc<UpstreamInstance>> {
        let instances = group.instances();
        if instances.is_empty() {
            self.exhausted.fetch_add(1, Ordering::Relaxed);
            return Err(GatewayError::exhausted(group.name()));
        }

        let start = group.cursor.load(Ordering::Relaxed) % instances.len();

        let (index, tier) = match Self::least_loaded(instances, start, HealthState::Healthy, exclude) {
            Some(index) => (index, HealthState::Healthy),
            None => match Self::least_loaded(instances, start, HealthState::Suspect, exclude) {
                Some(index) => (index, HealthState::Suspect),
                None => {
                    self.exhausted.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        group = %group.name(),
                        excluded = exclude.len(),
                        "No selectable instance left"
                    );
                    return Err(GatewayError::exhausted(group.name()));
                }
            },
        };

        group.cursor.store(index + 1, Ordering::Relaxed);
        self.selections.fetch_add(1, Ordering::Relaxed);
        if tier == HealthState::Suspect {
            self.suspect_fallbacks.fetch_add(1, Ordering::Relaxed);
        }

        let instance = Arc::clone(&instances[index]);
        debug!(
            group = %group.name(),
            instance = %instance.id(),
            state = %tier,
            in_flight = instance.in_flight(),
            "Selected upstream instance"
        );

        Ok(instance)
    }

    fn algorithm_name(&self) -> &'static str {
        "least_in_flight"
    }

    fn stats(&self) -> LoadBalancerStats {
        LoadBalancerStats {
            algorithm: self.algorithm_name().to_string(),
            selections: self.selections.load(Ordering::Relaxed),
            suspect_fallbacks: self.suspect_fallbacks.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::registry::UpstreamRegistry;
    use crate::observability::health::HealthState;

    fn registry(size: usize) -> UpstreamRegistry {
        let endpoints: Vec<String> = (0..size)
            .map(|i| format!("http://127.0.0.1:{}", 9000 + i))
            .collect();
        let mut registry = UpstreamRegistry::default();
        registry.add_group("books", &endpoints).unwrap();
        registry
    }

    fn set_state(instance: &UpstreamInstance, state: HealthState) {
        instance.health.lock().state = state;
    }

    #[test]
    fn test_round_robin_on_equal_load() {
        let registry = registry(3);
        let group = registry.group_by_name("books").unwrap();
        let balancer = LeastInFlightBalancer::new();
        let exclude = ExcludeSet::new();

        let picks: Vec<String> = (0..6)
            .map(|_| balancer.pick(group, &exclude).unwrap().id().to_string())
            .collect();

        assert_eq!(
            picks,
            vec!["books-0", "books-1", "books-2", "books-0", "books-1", "books-2"]
        );
        assert_eq!(balancer.stats().selections, 6);
    }

    #[test]
    fn test_prefers_least_in_flight() {
        let registry = registry(3);
        let group = registry.group_by_name("books").unwrap();
        let balancer = LeastInFlightBalancer::new();

        let _busy0 = group.instances()[0].begin_request();
        let _busy2a = group.instances()[2].begin_request();
        let _busy2b = group.instances()[2].begin_request();

        let picked = balancer.pick(group, &ExcludeSet::new()).unwrap();
        assert_eq!(picked.id(), "books-1");
    }

    #[test]
    fn test_never_returns_excluded_instance() {
        let registry = registry(3);
        let group = registry.group_by_name("books").unwrap();
        let balancer = LeastInFlightBalancer::new();

        let exclude: ExcludeSet = ["books-0".to_string(), "books-2".to_string()].into();
        for _ in 0..10 {
            assert_eq!(balancer.pick(group, &exclude).unwrap().id(), "books-1");
        }

        let all: ExcludeSet = group.instances().iter().map(|i| i.id().to_string()).collect();
        assert!(matches!(
            balancer.pick(group, &all),
            Err(GatewayError::Exhausted { .. })
        ));
    }

    #[test]
    fn test_suspect_fallback_only_without_healthy() {
        let registry = registry(2);
        let group = registry.group_by_name("books").unwrap();
        let balancer = LeastInFlightBalancer::new();

        set_state(&group.instances()[0], HealthState::Suspect);
        for _ in 0..4 {
            assert_eq!(balancer.pick(group, &ExcludeSet::new()).unwrap().id(), "books-1");
        }

        set_state(&group.instances()[1], HealthState::Unhealthy);
        assert_eq!(balancer.pick(group, &ExcludeSet::new()).unwrap().id(), "books-0");
        assert_eq!(balancer.stats().suspect_fallbacks, 1);
    }

    #[test]
    fn test_all_unhealthy_is_exhausted() {
        let registry = registry(2);
        let group = registry.group_by_name("books").unwrap();
        let balancer = LeastInFlightBalancer::new();

        for instance in group.instances() {
            set_state(instance, HealthState::Unhealthy);
        }

        let err = balancer.pick(group, &ExcludeSet::new()).unwrap_err();
        assert_eq!(err, GatewayError::exhausted("books"));
        assert_eq!(balancer.stats().exhausted, 1);
    }
}
