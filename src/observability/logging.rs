//! # Structured Logging
//!
//! Installs the global `tracing` subscriber.
//!
//! ## Key Features
//! - JSON lines (default) or human-readable text output
//! - `RUST_LOG` takes precedence over the configured level
//! - Request ids and instance ids travel as span and event fields, never as
//!   interpolated text

use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::config::LoggingConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn parse(value: &str) -> GatewayResult<Self> {
        match value.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            other => Err(GatewayError::config(format!("Invalid log format: {}", other))),
        }
    }
}

/// Filter used when `RUST_LOG` is unset
pub fn default_directives(level: &str) -> String {
    let level = level.to_lowercase();
    format!("biblioteca_gateway={level},tower_http={level},hyper=warn,reqwest=warn")
}

/// Install the global subscriber
///
/// A second call is harmless: the existing subscriber stays in place.
pub fn init_logging(config: &LoggingConfig) -> GatewayResult<()> {
    let format = LogFormat::parse(&config.format)?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(&config.level)))
        .map_err(|e| GatewayError::config(format!("Invalid log filter: {}", e)))?;

    let initialized = match format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
    };

    if initialized.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
        return Ok(());
    }

    info!(format = ?format, level = %config.level, "Structured logging initialized");
    Ok(())
}
