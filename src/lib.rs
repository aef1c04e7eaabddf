//! # Biblioteca+ API Gateway - Core Library Crate
//!
//! Single entry point in front of the Biblioteca+ backend services. The gateway
//! maps request paths to upstream groups, spreads load across each group's
//! instances, tracks their health, and retries failed attempts on another
//! instance when that is safe.
//!
//! ## Request Flow
//!
//! ```text
//! caller -> server (route, admit, read body) -> dispatcher
//!              dispatcher: pick instance -> forward -> stream response
//!                               ^                |
//!                               +---- retry -----+  (failure before headers)
//! ```
//!
//! ## Module Layout
//! - `core`: configuration, error taxonomy, request-scoped types
//! - `discovery`: static upstream groups and their instances
//! - `routing`: longest-prefix route table and path rewriting
//! - `load_balancing`: least-in-flight instance selection
//! - `observability`: health state machine, probing, logging, metrics
//! - `protocols`: outbound HTTP client and streaming response bodies
//! - `traffic`: retry policy and admission control
//! - `gateway`: the Axum server and dispatch loop
//! - `admin`: operator status endpoints

/// Core functionality including error types, configuration, and basic data structures
pub mod core;

/// Main gateway server implementation and HTTP handling
/// Contains the primary server logic that ties all other modules together
pub mod gateway;

/// Outbound HTTP proxying and response streaming
pub mod protocols;

/// Instance selection across an upstream group
pub mod load_balancing;

/// Static upstream registry built from configuration
pub mod discovery;

/// Request routing with segment-aware longest-prefix matching
pub mod routing;

/// Observability features: health tracking, metrics, logging
pub mod observability;

/// Traffic management: retries, backoff and concurrency limits
pub mod traffic;

/// Admin API for operator status and monitoring
pub mod admin;

// Re-export commonly used types for easier access

/// Main error type used throughout the gateway
pub use core::error::{GatewayError, GatewayResult};

/// Main configuration structure for the gateway
pub use core::config::GatewayConfig;

pub use core::types::RequestContext;

/// Route table and its builder
pub use routing::router::{Route, RouteTable, RouteTableBuilder};

/// The primary entry points for using this library
pub use gateway::server::{Gateway, GatewayServer};
