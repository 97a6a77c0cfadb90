//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogFormat};

/// Environment variable that overrides the configured log filter.
pub const LOG_ENV_VAR: &str = "DISH_LOG";

/// Builds the filter: `DISH_LOG` wins, then the configured level, then `info`.
#[must_use]
pub fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs a global fmt subscriber.
///
/// Returns an error rather than panicking if a subscriber is already set.
pub fn init_tracing(config: &LogConfig) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(false);

    let result = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_falls_back_on_bad_level() {
        let config = LogConfig {
            level: "not a [valid filter".to_string(),
            format: LogFormat::Text,
        };
        // Must not panic.
        let _ = env_filter(&config);
    }

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        let config = LogConfig::default();
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
