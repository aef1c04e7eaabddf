//! # Upstream Registry
//!
//! Arena of upstream groups and their instances, built once from static
//! configuration. Groups are addressed by [`GroupId`] (an index into the
//! arena) so request handling never allocates or hashes to find a group.
//!
//! ## Rust Concepts Used
//!
//! - `Arc<UpstreamInstance>` lets in-flight guards and streaming response
//!   bodies outlive the request handler that created them
//! - `AtomicUsize` for the in-flight counter, updated without locking
//! - `parking_lot::Mutex` for the health record, locked only for the
//!   duration of a state update and never across an `.await`
//! - RAII: [`InFlightGuard`] decrements the counter when dropped, so
//!   cancellation and early returns release the slot automatically

use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::Uri;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use url::Url;

use crate::core::config::UpstreamConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::observability::health::{HealthRecord, HealthState};
use crate::observability::metrics;

/// Index of an upstream group inside the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(usize);

impl GroupId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// One backend instance
pub struct UpstreamInstance {
    /// Stable id, `<group>-<index>`, safe to show to callers
    id: String,
    group: String,
    index: usize,

    /// Normalised `http://host:port`
    address: String,
    authority: Authority,

    /// Path from the configured address, prepended to every forwarded path
    base_path: String,

    in_flight: AtomicUsize,

    /// Health state, mutated only by the health tracker
    pub(crate) health: Mutex<HealthRecord>,
}

impl UpstreamInstance {
    /// Create an instance from a configured `http://host:port[/base]` address
    pub fn new(group: &str, index: usize, endpoint: &str) -> GatewayResult<Self> {
        let url = Url::parse(endpoint).map_err(|e| {
            GatewayError::config(format!("Invalid upstream address '{}': {}", endpoint, e))
        })?;

        if url.scheme() != "http" {
            return Err(GatewayError::config(format!(
                "Upstream address '{}' must use http",
                endpoint
            )));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| GatewayError::config(format!("Upstream address '{}' has no host", endpoint)))?;
        let port = url.port_or_known_default().unwrap_or(80);

        let authority: Authority = format!("{}:{}", host, port).parse().map_err(|e| {
            GatewayError::config(format!("Invalid upstream authority in '{}': {}", endpoint, e))
        })?;

        let base_path = url.path().trim_end_matches('/').to_string();

        Ok(Self {
            id: format!("{}-{}", group, index),
            group: group.to_string(),
            index,
            address: format!("http://{}", authority),
            authority,
            base_path,
            in_flight: AtomicUsize::new(0),
            health: Mutex::new(HealthRecord::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Network address, `http://host:port`. Not for caller-visible output
    /// unless `expose_upstream_addresses` is set.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Current number of requests outstanding against this instance
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn health_state(&self) -> HealthState {
        self.health.lock().state
    }

    /// Copy of the health record for reporting
    pub fn health_snapshot(&self) -> HealthRecord {
        self.health.lock().clone()
    }

    /// Reserve an in-flight slot, released when the guard is dropped
    pub fn begin_request(self: &Arc<Self>) -> InFlightGuard {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::record_in_flight(self, now);
        InFlightGuard {
            instance: Arc::clone(self),
        }
    }

    /// Build the outbound URI for an already rewritten path and query
    pub fn uri_for(&self, path_and_query: &str) -> GatewayResult<Uri> {
        let full = format!("{}{}", self.base_path, path_and_query);
        let path_and_query: PathAndQuery = full
            .parse()
            .map_err(|e| GatewayError::internal(format!("Invalid upstream path '{}': {}", full, e)))?;

        Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| GatewayError::internal(format!("Failed to build upstream URI: {}", e)))
    }

    /// Build the probe URI for `path`
    pub fn probe_url(&self, path: &str) -> String {
        format!("{}{}{}", self.address, self.base_path, path)
    }
}

impl fmt::Debug for UpstreamInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamInstance")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("in_flight", &self.in_flight())
            .field("state", &self.health_state())
            .finish()
    }
}

/// Holds one in-flight slot on an instance
#[derive(Debug)]
pub struct InFlightGuard {
    instance: Arc<UpstreamInstance>,
}

impl InFlightGuard {
    pub fn instance(&self) -> &Arc<UpstreamInstance> {
        &self.instance
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let now = self.instance.in_flight.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        metrics::record_in_flight(&self.instance, now);
    }
}

/// An ordered, immutable set of instances serving one route
#[derive(Debug)]
pub struct UpstreamGroup {
    id: GroupId,
    name: String,
    instances: Vec<Arc<UpstreamInstance>>,

    /// Round-robin tie-break position, advanced by the load selector
    pub(crate) cursor: AtomicUsize,
}

impl UpstreamGroup {
    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instances(&self) -> &[Arc<UpstreamInstance>] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// All upstream groups known to the gateway
#[derive(Debug, Default)]
pub struct UpstreamRegistry {
    groups: Vec<UpstreamGroup>,
    by_name: HashMap<String, GroupId>,
}

impl UpstreamRegistry {
    /// Build the registry from the `upstreams` section of the configuration
    pub fn from_config(upstreams: &BTreeMap<String, UpstreamConfig>) -> GatewayResult<Self> {
        let mut registry = Self::default();
        for (name, upstream) in upstreams {
            registry.add_group(name, &upstream.endpoints)?;
        }
        Ok(registry)
    }

    /// Register a group. Membership is fixed once added.
    pub fn add_group<S: AsRef<str>>(&mut self, name: &str, endpoints: &[S]) -> GatewayResult<GroupId> {
        if self.by_name.contains_key(name) {
            return Err(GatewayError::config(format!("Duplicate upstream group '{}'", name)));
        }
        if endpoints.is_empty() {
            return Err(GatewayError::config(format!("Upstream '{}' has no endpoints", name)));
        }

        let instances = endpoints
            .iter()
            .enumerate()
            .map(|(index, endpoint)| UpstreamInstance::new(name, index, endpoint.as_ref()).map(Arc::new))
            .collect::<GatewayResult<Vec<_>>>()?;

        let id = GroupId(self.groups.len());
        self.groups.push(UpstreamGroup {
            id,
            name: name.to_string(),
            instances,
            cursor: AtomicUsize::new(0),
        });
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn group_id(&self, name: &str) -> Option<GroupId> {
        self.by_name.get(name).copied()
    }

    pub fn group(&self, id: GroupId) -> Option<&UpstreamGroup> {
        self.groups.get(id.0)
    }

    pub fn group_by_name(&self, name: &str) -> Option<&UpstreamGroup> {
        self.group_id(name).and_then(|id| self.group(id))
    }

    pub fn groups(&self) -> &[UpstreamGroup] {
        &self.groups
    }

    /// Every instance of every group
    pub fn instances(&self) -> impl Iterator<Item = &Arc<UpstreamInstance>> {
        self.groups.iter().flat_map(|g| g.instances.iter())
    }

    pub fn find_instance(&self, id: &str) -> Option<&Arc<UpstreamInstance>> {
        self.instances().find(|instance| instance.id() == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_ids_and_addresses() {
        let mut registry = UpstreamRegistry::default();
        let id = registry
            .add_group("books", &["http://127.0.0.1:8080", "http://catalog.internal"])
            .unwrap();

        let group = registry.group(id).unwrap();
        assert_eq!(group.name(), "books");
        assert_eq!(group.len(), 2);
        assert_eq!(group.instances()[0].id(), "books-0");
        assert_eq!(group.instances()[1].id(), "books-1");
        assert_eq!(group.instances()[1].address(), "http://catalog.internal:80");
        assert_eq!(registry.group_id("books"), Some(id));
        assert!(registry.find_instance("books-1").is_some());
    }

    #[test]
    fn test_rejects_invalid_groups() {
        let mut registry = UpstreamRegistry::default();
        let empty: [&str; 0] = [];
        assert!(registry.add_group("empty", &empty).is_err());
        assert!(registry.add_group("tls", &["https://10.0.0.1"]).is_err());
        assert!(registry.add_group("junk", &["::nope::"]).is_err());

        registry.add_group("books", &["http://127.0.0.1:1"]).unwrap();
        assert!(registry.add_group("books", &["http://127.0.0.1:2"]).is_err());
    }

    #[test]
    fn test_uri_includes_base_path() {
        let instance = UpstreamInstance::new("users", 0, "http://127.0.0.1:3006/api/").unwrap();
        let uri = instance.uri_for("/users/5?active=true").unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:3006/api/users/5?active=true");
        assert_eq!(instance.probe_url("/health"), "http://127.0.0.1:3006/api/health");
    }

    #[test]
    fn test_in_flight_guard_releases_on_drop() {
        let instance = Arc::new(UpstreamInstance::new("books", 0, "http://127.0.0.1:8080").unwrap());

        let first = instance.begin_request();
        let second = instance.begin_request();
        assert_eq!(instance.in_flight(), 2);

        drop(first);
        assert_eq!(instance.in_flight(), 1);
        drop(second);
        assert_eq!(instance.in_flight(), 0);
    }

    #[test]
    fn test_new_instances_start_healthy() {
        let instance = UpstreamInstance::new("books", 0, "http://127.0.0.1:8080").unwrap();
        assert_eq!(instance.health_state(), HealthState::Healthy);
        assert_eq!(instance.health_snapshot().consecutive_failures, 0);
    }
}
