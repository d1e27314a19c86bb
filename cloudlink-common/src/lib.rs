//! cloudlink Common Library
//!
//! This crate provides shared types and utilities for cloudlink bridges:
//!
//! - [`config`] - Configuration loading (JSON5 format) and the [`BridgeConfig`] trait
//! - [`args`] - Common CLI arguments
//! - [`link`] - Connection state of a resilient link
//! - [`throttle`] - Rate limiting of repeated fault logs
//! - [`backoff`] - Reconnect delay schedule
//! - [`envelope`] - Wire messages exchanged with the cloud channel
//! - [`error`] - Error types

pub mod args;
pub mod backoff;
pub mod config;
pub mod envelope;
pub mod error;
pub mod link;
pub mod throttle;

// Re-export commonly used types at the crate root
pub use args::BridgeArgs;
pub use backoff::Backoff;
pub use config::{BridgeConfig, LogFormat, LoggingConfig, load_config, parse_config};
pub use envelope::{Action, InboundCommand, OutboundEnvelope, RegisterFrame, decode_command};
pub use error::{Error, Result};
pub use link::LinkState;
pub use throttle::{DEFAULT_THROTTLE_WINDOW, ErrorKey, ErrorThrottle};

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level. Supports two
/// output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// # Example
///
/// ```ignore
/// use cloudlink_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
