//! Tracing subscriber setup
//!
//! `RUST_LOG` wins over the configured level when set.

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// `level`, raised to DEBUG when `verbose`
pub fn effective_level(level: Level, verbose: bool) -> Level {
    if verbose && level < Level::DEBUG {
        Level::DEBUG
    } else {
        level
    }
}

/// Env filter defaulting to `level`
pub fn build_filter(level: Level, verbose: bool) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(effective_level(level, verbose).into())
        .from_env_lossy()
}

/// Install the global subscriber
///
/// Fails if a global subscriber is already installed.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let level: Level = config
        .level
        .to_lowercase()
        .parse()
        .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))?;
    let filter = build_filter(level, verbose);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.format.to_lowercase().as_str() {
        "json" => builder
            .json()
            .with_current_span(true)
            .with_target(true)
            .try_init(),
        "pretty" => builder.pretty().try_init(),
        _ => builder.compact().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}
