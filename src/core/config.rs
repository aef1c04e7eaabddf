//! # Configuration Module
//!
//! Static configuration for the gateway, loaded once at startup.
//!
//! ## Key Features
//! - YAML parsing with serde, durations written as `"5s"`, `"250ms"`
//! - Environment variable overrides for the settings operators change most
//! - Validation that reports every problem at once instead of the first one
//!
//! Nothing here is reloaded at runtime: routes and upstream membership are
//! fixed for the lifetime of the process.

use axum::http::{HeaderValue, Method};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};
use crate::routing::router::normalize_pattern;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG_PATH";

/// Configuration file used when `GATEWAY_CONFIG_PATH` is unset
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listeners and request limits
    pub server: ServerConfig,

    /// Outbound connection behaviour
    pub proxy: ProxyConfig,

    /// Retry bound and per-request deadline
    pub retry: RetryConfig,

    /// Active probing and state machine thresholds
    pub health_check: HealthCheckConfig,

    /// CORS policy applied on the proxy listener
    pub cors: CorsConfig,

    /// Logging and metrics
    pub observability: ObservabilityConfig,

    /// Upstream groups keyed by group id
    pub upstreams: BTreeMap<String, UpstreamConfig>,

    /// Route definitions, in priority order for equal-length patterns
    pub routes: Vec<RouteDefinition>,
}

impl GatewayConfig {
    /// Load configuration from a YAML file, apply environment overrides and validate
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string without validating it
    pub fn from_yaml(content: &str) -> GatewayResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        self.apply_env_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` to read variables
    ///
    /// Supported variables:
    /// - `GATEWAY_SERVER_BIND_ADDRESS`: full proxy listen address
    /// - `PORT`: replaces only the port of the proxy listen address
    /// - `GATEWAY_REQUEST_DEADLINE`: per-request deadline, e.g. `"5s"`
    /// - `GATEWAY_LOG_LEVEL`, `GATEWAY_LOG_FORMAT`
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> GatewayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("GATEWAY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Some(port) = lookup("PORT") {
            let port: u16 = port
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid PORT: {}", e)))?;
            let mut addr: SocketAddr = self.server.bind_address.parse().map_err(|e| {
                GatewayError::config(format!(
                    "Cannot apply PORT to bind_address '{}': {}",
                    self.server.bind_address, e
                ))
            })?;
            addr.set_port(port);
            self.server.bind_address = addr.to_string();
        }

        if let Some(deadline) = lookup("GATEWAY_REQUEST_DEADLINE") {
            self.retry.request_deadline = humantime::parse_duration(&deadline).map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_REQUEST_DEADLINE: {}", e))
            })?;
        }

        if let Some(level) = lookup("GATEWAY_LOG_LEVEL") {
            self.observability.logging.level = level;
        }

        if let Some(format) = lookup("GATEWAY_LOG_FORMAT") {
            self.observability.logging.format = format;
        }

        Ok(())
    }

    /// Comprehensive configuration validation with detailed error messages
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        // Server
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server bind_address: '{}'",
                self.server.bind_address
            ));
        }
        if self.server.admin_bind_address.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server admin_bind_address: '{}'",
                self.server.admin_bind_address
            ));
        }
        if self.server.max_request_size == 0 {
            errors.push("max_request_size must be greater than 0".to_string());
        }
        if self.server.max_concurrent_requests == 0 {
            errors.push("max_concurrent_requests must be greater than 0".to_string());
        }

        // Retry
        if self.retry.max_attempts == 0 {
            errors.push("retry max_attempts must be at least 1".to_string());
        }
        if self.retry.request_deadline.is_zero() {
            errors.push("retry request_deadline must be greater than 0".to_string());
        }
        if matches!(self.retry.attempt_timeout, Some(t) if t.is_zero()) {
            errors.push("retry attempt_timeout must be greater than 0 when set".to_string());
        }
        if self.retry.backoff_min > self.retry.backoff_max {
            errors.push(format!(
                "retry backoff_min ({:?}) must not exceed backoff_max ({:?})",
                self.retry.backoff_min, self.retry.backoff_max
            ));
        }

        // Health checks
        let hc = &self.health_check;
        if !hc.path.starts_with('/') {
            errors.push(format!("health_check path must start with '/': '{}'", hc.path));
        }
        if hc.interval.is_zero() || hc.timeout.is_zero() {
            errors.push("health_check interval and timeout must be greater than 0".to_string());
        }
        for (name, value) in [
            ("failure_threshold", hc.failure_threshold),
            ("suspect_failure_threshold", hc.suspect_failure_threshold),
            ("probe_failure_threshold", hc.probe_failure_threshold),
            ("recovery_threshold", hc.recovery_threshold),
        ] {
            if value == 0 {
                errors.push(format!("health_check {} must be greater than 0", name));
            }
        }

        // Upstream groups
        for (name, upstream) in &self.upstreams {
            if name.is_empty() {
                errors.push("Upstream group id cannot be empty".to_string());
            }
            if upstream.endpoints.is_empty() {
                errors.push(format!("Upstream '{}' has no endpoints", name));
            }
            for endpoint in &upstream.endpoints {
                if let Err(reason) = check_endpoint(endpoint) {
                    errors.push(format!(
                        "Upstream '{}' has invalid address '{}': {}",
                        name, endpoint, reason
                    ));
                }
            }
        }

        // Routes
        let mut seen = HashSet::new();
        for (index, route) in self.routes.iter().enumerate() {
            match normalize_pattern(&route.pattern) {
                Ok(pattern) => {
                    if !seen.insert(pattern.clone()) {
                        errors.push(format!("Duplicate route pattern '{}'", pattern));
                    }
                }
                Err(reason) => errors.push(format!("Route {}: {}", index, reason)),
            }

            if route.upstream.is_empty() {
                errors.push(format!("Route '{}' has empty upstream", route.pattern));
            } else if !self.upstreams.contains_key(&route.upstream) {
                errors.push(format!(
                    "Route '{}' references unknown upstream '{}'",
                    route.pattern, route.upstream
                ));
            }

            if let Some(prefix) = &route.upstream_prefix {
                if !prefix.is_empty() && !prefix.starts_with('/') {
                    errors.push(format!(
                        "Route '{}' upstream_prefix must start with '/': '{}'",
                        route.pattern, prefix
                    ));
                }
            }
        }

        // CORS
        if self.cors.enabled {
            let wildcard = self.cors.allowed_origins.iter().any(|o| o == "*");
            if wildcard && self.cors.allow_credentials {
                errors.push("cors allow_credentials cannot be combined with origin '*'".to_string());
            }
            for origin in self.cors.allowed_origins.iter().filter(|o| *o != "*") {
                if HeaderValue::from_str(origin).is_err() {
                    errors.push(format!("Invalid cors origin: '{}'", origin));
                }
            }
            for method in &self.cors.allowed_methods {
                if method.parse::<Method>().is_err() {
                    errors.push(format!("Invalid cors method: '{}'", method));
                }
            }
        }

        // Observability
        match self.observability.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => errors.push(format!(
                "Invalid log level: {}",
                self.observability.logging.level
            )),
        }

        match self.observability.logging.format.to_lowercase().as_str() {
            "json" | "text" => {}
            _ => errors.push(format!(
                "Invalid log format: {}",
                self.observability.logging.format
            )),
        }

        if !errors.is_empty() {
            return Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }
}

/// Check that an upstream address is `http://host[:port][/base]`
fn check_endpoint(endpoint: &str) -> Result<(), String> {
    let url = Url::parse(endpoint).map_err(|e| e.to_string())?;
    if url.scheme() != "http" {
        return Err(format!("unsupported scheme '{}'", url.scheme()));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err("missing host".to_string());
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err("query and fragment are not allowed".to_string());
    }
    Ok(())
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Proxy listener address
    pub bind_address: String,

    /// Admin listener address (status, health, metrics)
    pub admin_bind_address: String,

    /// Maximum inbound request body size in bytes
    pub max_request_size: usize,

    /// Proxied requests admitted at once before shedding with 503
    pub max_concurrent_requests: usize,

    /// Plain-text answer for `GET /` when no route claims it
    pub banner: Option<String>,

    /// Include upstream addresses in error bodies and the status endpoint
    pub expose_upstream_addresses: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3001".to_string(),
            admin_bind_address: "127.0.0.1:9091".to_string(),
            max_request_size: 10 * 1024 * 1024, // 10MB
            max_concurrent_requests: 1024,
            banner: None,
            expose_upstream_addresses: false,
        }
    }
}

/// Outbound connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// TCP connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Idle pooled connections are closed after this long
    #[serde(with = "humantime_serde")]
    pub pool_idle_timeout: Duration,

    pub pool_max_idle_per_host: usize,

    /// Rewrite `Host` to the upstream authority
    pub change_origin: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 32,
            change_origin: true,
        }
    }
}

/// Retry bound and deadline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per request, first one included
    pub max_attempts: u32,

    /// Overall deadline per request
    #[serde(with = "humantime_serde")]
    pub request_deadline: Duration,

    /// Cap on a single attempt; unset means the remaining deadline
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Option<Duration>,

    #[serde(with = "humantime_serde")]
    pub backoff_min: Duration,

    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            request_deadline: Duration::from_secs(5),
            attempt_timeout: None,
            backoff_min: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Run active probes
    pub enabled: bool,

    /// Probe path appended to each instance address
    pub path: String,

    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Consecutive live failures moving Healthy to Suspect
    pub failure_threshold: u32,

    /// Consecutive live failures moving Suspect to Unhealthy
    pub suspect_failure_threshold: u32,

    /// Consecutive probe failures moving Suspect to Unhealthy
    pub probe_failure_threshold: u32,

    /// Consecutive successes moving Suspect to Healthy
    pub recovery_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/health".to_string(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            failure_threshold: 3,
            suspect_failure_threshold: 2,
            probe_failure_threshold: 2,
            recovery_threshold: 1,
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: vec!["http://localhost:3000".to_string()],
            allowed_methods: ["GET", "POST", "PUT", "DELETE"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            allow_credentials: true,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: String,

    /// `json` or `text`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install the Prometheus recorder and serve `/metrics` on the admin listener
    pub prometheus_enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus_enabled: true,
        }
    }
}

/// One upstream group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Instance addresses, `http://host:port`
    pub endpoints: Vec<String>,
}

/// Route definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDefinition {
    /// Path prefix, e.g. `/books`
    pub pattern: String,

    /// Target upstream group id
    pub upstream: String,

    /// Remove the matched prefix before forwarding
    #[serde(default)]
    pub strip_prefix: bool,

    /// Prefix prepended to the forwarded path
    #[serde(default)]
    pub upstream_prefix: Option<String>,

    /// Message shown to callers when the upstream fails
    #[serde(default)]
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tokio::fs;

    fn sample_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.upstreams.insert(
            "users".to_string(),
            UpstreamConfig {
                endpoints: vec!["http://127.0.0.1:3006".to_string()],
            },
        );
        config.routes.push(RouteDefinition {
            pattern: "/users".to_string(),
            upstream: "users".to_string(),
            strip_prefix: true,
            upstream_prefix: Some("/users".to_string()),
            error_message: None,
        });
        config
    }

    #[test]
    fn test_default_config_validation() {
        assert!(GatewayConfig::default().validate().is_ok());
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.request_deadline, Duration::from_secs(5));
        assert_eq!(config.health_check.interval, Duration::from_secs(10));
        assert_eq!(config.health_check.failure_threshold, 3);
        assert_eq!(config.health_check.probe_failure_threshold, 2);
        assert_eq!(config.server.max_concurrent_requests, 1024);
    }

    #[tokio::test]
    async fn test_load_config_from_yaml_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("gateway.yaml");

        let config_content = r#"
server:
  bind_address: "127.0.0.1:3001"
  banner: "API Gateway rodando!"

retry:
  max_attempts: 2
  request_deadline: "3s"
  attempt_timeout: "750ms"

health_check:
  enabled: false
  interval: "30s"

upstreams:
  users:
    endpoints: ["http://127.0.0.1:3006", "http://127.0.0.1:3007"]
  bibliotecarios:
    endpoints: ["http://127.0.0.1:3006"]

routes:
  - pattern: "/users"
    upstream: users
    strip_prefix: true
    upstream_prefix: "/users"
    error_message: "Erro Users Service"
  - pattern: "/bibliotecarios"
    upstream: bibliotecarios
"#;

        fs::write(&config_path, config_content).await.unwrap();

        let config = GatewayConfig::load_from_file(&config_path).await.unwrap();

        assert_eq!(config.server.bind_address, "127.0.0.1:3001");
        assert_eq!(config.server.banner.as_deref(), Some("API Gateway rodando!"));
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.request_deadline, Duration::from_secs(3));
        assert_eq!(config.retry.attempt_timeout, Some(Duration::from_millis(750)));
        assert!(!config.health_check.enabled);
        assert_eq!(config.health_check.timeout, Duration::from_secs(2));
        assert_eq!(config.upstreams["users"].endpoints.len(), 2);
        assert_eq!(config.routes.len(), 2);
        assert!(config.routes[0].strip_prefix);
        assert!(!config.routes[1].strip_prefix);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = GatewayConfig::load_from_file(temp_dir.path().join("nope.yaml")).await;
        assert!(matches!(result, Err(GatewayError::Configuration { .. })));
    }

    #[test]
    fn test_environment_variable_overrides() {
        let vars: HashMap<&str, &str> = [
            ("GATEWAY_SERVER_BIND_ADDRESS", "127.0.0.1:8080"),
            ("PORT", "3001"),
            ("GATEWAY_REQUEST_DEADLINE", "2s"),
            ("GATEWAY_LOG_LEVEL", "debug"),
            ("GATEWAY_LOG_FORMAT", "text"),
        ]
        .into_iter()
        .collect();

        let mut config = GatewayConfig::default();
        config
            .apply_env_overrides_from(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.bind_address, "127.0.0.1:3001");
        assert_eq!(config.retry.request_deadline, Duration::from_secs(2));
        assert_eq!(config.observability.logging.level, "debug");
        assert_eq!(config.observability.logging.format, "text");
    }

    #[test]
    fn test_invalid_environment_variables() {
        let mut config = GatewayConfig::default();
        let result = config.apply_env_overrides_from(|key| {
            (key == "PORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());

        let result = config.apply_env_overrides_from(|key| {
            (key == "GATEWAY_REQUEST_DEADLINE").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_collects_every_error() {
        let mut config = sample_config();
        config.upstreams.insert("empty".to_string(), UpstreamConfig::default());
        config.upstreams.insert(
            "bad".to_string(),
            UpstreamConfig {
                endpoints: vec!["ftp://10.0.0.1:21".to_string(), "not a url".to_string()],
            },
        );
        config.routes.push(RouteDefinition {
            pattern: "/users/".to_string(),
            upstream: "users".to_string(),
            strip_prefix: false,
            upstream_prefix: None,
            error_message: None,
        });
        config.routes.push(RouteDefinition {
            pattern: "/loans".to_string(),
            upstream: "loans".to_string(),
            strip_prefix: false,
            upstream_prefix: None,
            error_message: None,
        });

        let message = match config.validate() {
            Err(GatewayError::Configuration { message }) => message,
            other => panic!("expected configuration error, got {:?}", other),
        };

        assert!(message.contains("Upstream 'empty' has no endpoints"));
        assert!(message.contains("unsupported scheme 'ftp'"));
        assert!(message.contains("'not a url'"));
        assert!(message.contains("Duplicate route pattern '/users'"));
        assert!(message.contains("unknown upstream 'loans'"));
    }

    #[test]
    fn test_retry_and_health_validation() {
        let mut config = sample_config();
        config.retry.max_attempts = 0;
        config.retry.backoff_min = Duration::from_millis(100);
        config.health_check.failure_threshold = 0;
        config.observability.logging.format = "xml".to_string();

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("max_attempts"));
        assert!(message.contains("backoff_min"));
        assert!(message.contains("failure_threshold"));
        assert!(message.contains("Invalid log format"));
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config = GatewayConfig::from_yaml(include_str!("../../config/gateway.yaml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.server.banner.as_deref(), Some("API Gateway rodando!"));
    }

    #[test]
    fn test_cors_wildcard_with_credentials_rejected() {
        let mut config = sample_config();
        config.cors.allowed_origins = vec!["*".to_string()];
        config.cors.allow_credentials = true;
        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("allow_credentials"));

        config.cors.allow_credentials = false;
        assert!(config.validate().is_ok());
    }
}
