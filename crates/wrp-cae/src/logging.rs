//! Tracing subscriber setup for processes embedding the engine.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Installs the global subscriber, filtered by `RUST_LOG`. Returns false if
/// one was already installed.
pub fn init(format: LogFormat) -> bool {
    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    let result = match format {
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    result.is_ok()
}
