//! Subscriber setup shared by the binaries.

use crate::config::LoggingConfig;
use anyhow::{Context, Result, anyhow};
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins; otherwise the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("Invalid logging.level '{}'", config.level)),
    }
}

/// Install a global `fmt` subscriber writing to stderr. Stdout is left for
/// command output (and the MCP protocol).
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config)?)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_parses() {
        let config = LoggingConfig {
            level: "ragline_retriever=debug,warn".to_string(),
            json: false,
        };
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(env_filter(&config).is_ok());
        }
    }
}
