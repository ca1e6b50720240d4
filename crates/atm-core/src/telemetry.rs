//! Log subscriber setup

use crate::config::LoggingConfig;
use crate::error::{AtmError, AtmResult};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `config.level`. Returns `Ok(false)` when a subscriber
/// was already installed.
///
/// # Errors
/// Returns [`AtmError::Config`] if the level directive does not parse
pub fn init_tracing(config: &LoggingConfig) -> AtmResult<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| AtmError::Config(format!("logging.level '{}': {e}", config.level)))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry.with(fmt::layer().json()).try_init().is_ok()
    } else {
        registry.with(fmt::layer()).try_init().is_ok()
    };
    if installed {
        tracing::debug!(json = config.json, "tracing initialized");
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_harmless() {
        let config = LoggingConfig::default();
        init_tracing(&config).unwrap();
        assert!(!init_tracing(&config).unwrap());
    }
}
