//! Diagnostic logging setup.
//!
//! Everything goes to stderr: stdout is the upstream MCP channel and must
//! carry protocol traffic only.

use tracing::Subscriber;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter,
};

const DEFAULT_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Level used when `RUST_LOG` is unset: CLI flag, then config, then `info`.
pub fn resolve_level<'a>(cli: Option<&'a str>, config: Option<&'a str>) -> &'a str {
    cli.filter(|level| !level.is_empty())
        .or(config.filter(|level| !level.is_empty()))
        .unwrap_or(DEFAULT_LEVEL)
}

/// `RUST_LOG` if set and valid, `default_level` otherwise.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber.
pub fn init(format: LogFormat, default_level: &str) -> Result<(), TryInitError> {
    let registry = tracing_subscriber::registry().with(env_filter(default_level));
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    }
}

/// Short-lived stderr subscriber for work done before the level is known,
/// such as loading the config file.
pub fn bootstrap_subscriber(default_level: &str) -> impl Subscriber + Send + Sync {
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter(default_level))
        .finish()
}
