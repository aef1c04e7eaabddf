//! # Router Module
//!
//! Immutable route table mapping path prefixes to upstream groups.
//!
//! Matching is longest-prefix-wins and segment aware: `/books` matches
//! `/books` and `/books/12` but not `/bookshelf`. Routes are sorted once at
//! build time (longest pattern first, configuration order among equals), so
//! a lookup is a linear scan that stops at the first hit and takes no lock.
//!
//! ## Rust Concepts Used
//!
//! - `Arc<Route>` lets a request hold on to its route after the lookup
//! - The builder collects every problem before failing, mirroring
//!   configuration validation
//! - A stable sort keeps configuration order for equal-length patterns

use axum::http::Uri;
use std::collections::HashSet;
use std::sync::Arc;

use crate::core::config::RouteDefinition;
use crate::core::error::{GatewayError, GatewayResult};
use crate::discovery::registry::{GroupId, UpstreamRegistry};

/// Normalise a route pattern
///
/// A pattern must start with `/`. Trailing slashes are dropped, except for
/// the root pattern `/` itself.
pub fn normalize_pattern(raw: &str) -> Result<String, String> {
    let raw = raw.trim();
    if !raw.starts_with('/') {
        return Err(format!("pattern '{}' must start with '/'", raw));
    }
    if raw.contains(['?', '#', '*']) {
        return Err(format!("pattern '{}' must be a plain path prefix", raw));
    }

    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

/// Route definition with prefix pattern and rewrite rule
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    /// Path prefix, e.g. `/books`
    pub pattern: String,

    /// Target upstream group
    pub group: GroupId,

    /// Target upstream group name, for logs and metrics
    pub upstream: String,

    /// Remove `pattern` from the forwarded path
    pub strip_prefix: bool,

    /// Prepended to the forwarded path, `""` for none
    pub upstream_prefix: String,

    /// Caller-facing message for upstream failures on this route
    pub error_message: Option<String>,
}

impl Route {
    /// Create a route forwarding paths unchanged
    pub fn new(pattern: &str, group: GroupId, upstream: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            group,
            upstream: upstream.to_string(),
            strip_prefix: false,
            upstream_prefix: String::new(),
            error_message: None,
        }
    }

    /// Strip the matched prefix and prepend `upstream_prefix` instead
    pub fn with_rewrite(mut self, strip_prefix: bool, upstream_prefix: &str) -> Self {
        self.strip_prefix = strip_prefix;
        self.upstream_prefix = upstream_prefix.trim_end_matches('/').to_string();
        self
    }

    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = Some(message.to_string());
        self
    }

    /// Segment-aware prefix test
    pub fn matches(&self, path: &str) -> bool {
        if self.pattern == "/" {
            return path.starts_with('/');
        }
        match path.strip_prefix(self.pattern.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Path and query to send upstream for `uri`
    pub fn rewrite(&self, uri: &Uri) -> String {
        let path = uri.path();
        let remainder = if self.strip_prefix && self.pattern != "/" {
            path.strip_prefix(self.pattern.as_str()).unwrap_or(path)
        } else {
            path
        };

        let mut rewritten = String::with_capacity(self.upstream_prefix.len() + path.len() + 1);
        rewritten.push_str(&self.upstream_prefix);
        if remainder.is_empty() || remainder == "/" {
            if rewritten.is_empty() || remainder == "/" {
                rewritten.push('/');
            }
        } else {
            if !remainder.starts_with('/') {
                rewritten.push('/');
            }
            rewritten.push_str(remainder);
        }

        if let Some(query) = uri.query() {
            rewritten.push('?');
            rewritten.push_str(query);
        }

        rewritten
    }
}

/// Longest-prefix route table
#[derive(Debug, Default)]
pub struct RouteTable {
    /// Routes in match order
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn builder() -> RouteTableBuilder {
        RouteTableBuilder::new()
    }

    /// Build the table from configured routes, resolving group names
    pub fn from_config(definitions: &[RouteDefinition], registry: &UpstreamRegistry) -> GatewayResult<Self> {
        let mut builder = RouteTableBuilder::new();
        for definition in definitions {
            let Some(group) = registry.group_id(&definition.upstream) else {
                builder.errors.push(format!(
                    "Route '{}' references unknown upstream '{}'",
                    definition.pattern, definition.upstream
                ));
                continue;
            };

            let mut route = Route::new(&definition.pattern, group, &definition.upstream).with_rewrite(
                definition.strip_prefix,
                definition.upstream_prefix.as_deref().unwrap_or(""),
            );
            route.error_message = definition.error_message.clone();
            builder = builder.route(route);
        }
        builder.build()
    }

    /// Find the route for `path`
    pub fn match_path(&self, path: &str) -> Option<&Arc<Route>> {
        self.routes.iter().find(|route| route.matches(path))
    }

    /// Routes in match order
    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Builder for `RouteTable`
#[derive(Debug, Default)]
pub struct RouteTableBuilder {
    routes: Vec<Route>,
    errors: Vec<String>,
}

impl RouteTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route; later routes lose ties against earlier ones
    pub fn route(mut self, mut route: Route) -> Self {
        match normalize_pattern(&route.pattern) {
            Ok(pattern) => {
                route.pattern = pattern;
                self.routes.push(route);
            }
            Err(reason) => self.errors.push(reason),
        }
        self
    }

    /// Build the table, failing on invalid or duplicate patterns
    pub fn build(self) -> GatewayResult<RouteTable> {
        let mut errors = self.errors;
        let mut seen = HashSet::new();
        for route in &self.routes {
            if !seen.insert(route.pattern.as_str()) {
                errors.push(format!("Duplicate route pattern '{}'", route.pattern));
            }
        }

        if !errors.is_empty() {
            return Err(GatewayError::config(format!(
                "Invalid route table:\n{}",
                errors.join("\n")
            )));
        }

        let mut routes: Vec<Arc<Route>> = self.routes.into_iter().map(Arc::new).collect();
        // Stable: equal lengths keep configuration order
        routes.sort_by(|a, b| b.pattern.len().cmp(&a.pattern.len()));

        Ok(RouteTable { routes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups() -> (UpstreamRegistry, GroupId, GroupId) {
        let mut registry = UpstreamRegistry::default();
        let books = registry.add_group("books", &["http://127.0.0.1:9001"]).unwrap();
        let users = registry.add_group("users", &["http://127.0.0.1:9002"]).unwrap();
        (registry, books, users)
    }

    #[test]
    fn test_normalize_pattern() {
        assert_eq!(normalize_pattern("/books/").unwrap(), "/books");
        assert_eq!(normalize_pattern("///").unwrap(), "/");
        assert_eq!(normalize_pattern(" /users ").unwrap(), "/users");
        assert!(normalize_pattern("books").is_err());
        assert!(normalize_pattern("/books/*").is_err());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let (_, books, users) = groups();
        let table = RouteTable::builder()
            .route(Route::new("/", users, "users"))
            .route(Route::new("/books", books, "books"))
            .route(Route::new("/books/rare", users, "users"))
            .build()
            .unwrap();

        assert_eq!(table.match_path("/books/rare/1").unwrap().pattern, "/books/rare");
        assert_eq!(table.match_path("/books/12").unwrap().pattern, "/books");
        assert_eq!(table.match_path("/books").unwrap().pattern, "/books");
        assert_eq!(table.match_path("/loans").unwrap().pattern, "/");
    }

    #[test]
    fn test_matching_is_segment_aware() {
        let (_, books, _) = groups();
        let table = RouteTable::builder()
            .route(Route::new("/books", books, "books"))
            .build()
            .unwrap();

        assert!(table.match_path("/bookshelf").is_none());
        assert!(table.match_path("/book").is_none());
        assert!(table.match_path("/books/").is_some());
        assert!(table.match_path("/").is_none());
    }

    #[test]
    fn test_equal_length_keeps_configuration_order() {
        let (_, books, users) = groups();
        let table = RouteTable::builder()
            .route(Route::new("/aa", books, "books"))
            .route(Route::new("/bb", users, "users"))
            .route(Route::new("/cc", books, "books"))
            .build()
            .unwrap();

        let order: Vec<&str> = table.routes().iter().map(|r| r.pattern.as_str()).collect();
        assert_eq!(order, vec!["/aa", "/bb", "/cc"]);
    }

    #[test]
    fn test_duplicate_patterns_rejected() {
        let (_, books, users) = groups();
        let result = RouteTable::builder()
            .route(Route::new("/books", books, "books"))
            .route(Route::new("/books/", users, "users"))
            .build();

        match result {
            Err(GatewayError::Configuration { message }) => {
                assert!(message.contains("Duplicate route pattern '/books'"))
            }
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_prefix_rewrite() {
        let (_, _, users) = groups();
        let route = Route::new("/users", users, "users").with_rewrite(true, "/users/");

        assert_eq!(route.rewrite(&Uri::from_static("/users/5")), "/users/5");
        assert_eq!(route.rewrite(&Uri::from_static("/users")), "/users");
        assert_eq!(route.rewrite(&Uri::from_static("/users/?page=2")), "/users/?page=2");

        let api = Route::new("/api/books", users, "users").with_rewrite(true, "/v2");
        assert_eq!(api.rewrite(&Uri::from_static("/api/books/12?x=1")), "/v2/12?x=1");

        let stripped = Route::new("/api", users, "users").with_rewrite(true, "");
        assert_eq!(stripped.rewrite(&Uri::from_static("/api")), "/");
        assert_eq!(stripped.rewrite(&Uri::from_static("/api/ping")), "/ping");

        let untouched = Route::new("/books", users, "users");
        assert_eq!(untouched.rewrite(&Uri::from_static("/books/1")), "/books/1");
    }

    #[test]
    fn test_from_config_resolves_groups() {
        let (registry, _, users) = groups();
        let definitions = vec![RouteDefinition {
            pattern: "/bibliotecarios".to_string(),
            upstream: "users".to_string(),
            strip_prefix: true,
            upstream_prefix: Some("/bibliotecarios".to_string()),
            error_message: Some("Erro Bibliotecarios Service".to_string()),
        }];

        let table = RouteTable::from_config(&definitions, &registry).unwrap();
        let route = table.match_path("/bibliotecarios/7").unwrap();
        assert_eq!(route.group, users);
        assert_eq!(route.error_message.as_deref(), Some("Erro Bibliotecarios Service"));

        let unknown = vec![RouteDefinition {
            pattern: "/loans".to_string(),
            upstream: "loans".to_string(),
            strip_prefix: false,
            upstream_prefix: None,
            error_message: None,
        }];
        assert!(RouteTable::from_config(&unknown, &registry).is_err());
    }
}
