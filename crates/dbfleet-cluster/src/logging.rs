//! Tracing initialization for the cluster manager binary/host process.
//!
//! Library consumers are free to install their own subscriber; this
//! module is a convenience for binaries that embed a [`crate::ClusterManager`]
//! and just want sane defaults: `RUST_LOG`-driven filtering, falling back
//! to `info`, with either human-readable or JSON output.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format for the default subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Install a global tracing subscriber reading `RUST_LOG` (default
/// `info`) for filtering. Returns an error if a global subscriber is
/// already installed.
pub fn init(format: LogFormat) -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).try_init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_variants_are_distinct() {
        assert_ne!(LogFormat::Text, LogFormat::Json);
    }
}
