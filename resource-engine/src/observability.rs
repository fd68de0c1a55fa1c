//! Structured logging setup

use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

/// Initialize JSON tracing output filtered by `engine.log_level`
///
/// Falls back to `info` when the configured directive does not parse. Calling
/// this more than once is harmless: later calls leave the first subscriber in place.
pub fn init_tracing(config: &Config) -> Result<()> {
    let log_level = config.engine.log_level.clone();

    let installed = tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Tracing initialized for engine: {}", config.engine.name);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        let config = Config::default();
        assert!(init_tracing(&config).is_ok());
        assert!(init_tracing(&config).is_ok());
    }

    #[test]
    fn test_init_tracing_with_bad_directive_falls_back() {
        let mut config = Config::default();
        config.engine.log_level = "not a [valid directive".to_string();
        assert!(init_tracing(&config).is_ok());
    }
}
