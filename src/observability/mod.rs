// Upstream health state machine and active probing
pub mod health;

// Structured logging
pub mod logging;

// Metrics collection and Prometheus export
pub mod metrics;

// Re-export commonly used types for convenience
pub use health::{HealthEvent, HealthProbe, HealthState, HealthTracker, HttpHealthProbe, ProbeResult};
pub use logging::init_logging;
