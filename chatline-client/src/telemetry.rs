//! Logging initialization.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chatline_core::ConfigError;

use crate::config::LoggingConfig;

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Build the filter: `RUST_LOG` when set, the configured directives otherwise.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, ConfigError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|err| ConfigError::invalid("logging.filter", err.to_string())),
    }
}

/// Install the global tracing subscriber.
///
/// Only the first call installs anything; later calls return `Ok(())`. A
/// subscriber installed by someone else is left in place.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = build_filter(config)?;
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let json_layer = config.json.then(|| tracing_subscriber::fmt::layer().json());
    let text_layer = (!config.json).then(tracing_subscriber::fmt::layer);
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init();

    match installed {
        Ok(()) => tracing::info!(json = config.json, "Logging initialized"),
        Err(err) => tracing::debug!(error = %err, "Global subscriber already set; keeping it"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            filter: "chatline=notalevel".to_string(),
            json: false,
        };
        assert!(matches!(
            build_filter(&config),
            Err(ConfigError::InvalidValue { field: "logging.filter", .. })
        ));
    }

    #[test]
    fn test_init_twice_is_ok() {
        let config = LoggingConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&LoggingConfig { json: true, ..config }).is_ok());
    }
}
