//! Logging setup
//!
//! Installs the global tracing subscriber and keeps a reload handle so the
//! log level of a running replica can be changed through `setlogging`.

use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Handle for changing the active log filter at runtime
#[derive(Clone)]
pub struct LogLevelControl {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogLevelControl {
    /// Replace the active filter with `level` (any `EnvFilter` directive)
    pub fn set_level(&self, level: &str) -> Result<()> {
        let filter = EnvFilter::try_new(level)
            .map_err(|e| Error::Config(format!("Invalid log level '{}': {}", level, e)))?;
        self.handle
            .reload(filter)
            .map_err(|e| Error::Internal(format!("Failed to reload log filter: {}", e)))?;
        tracing::info!("Log level changed to {}", level);
        Ok(())
    }
}

/// Initialize logging
pub fn init_logging(config: &LoggingConfig) -> LogLevelControl {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.level.as_str().into());
    let (filter, handle) = reload::Layer::new(env_filter);

    let registry = tracing_subscriber::registry().with(filter);

    match (config.format.as_str(), &config.file) {
        (format, Some(path)) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path);
            match file {
                Ok(file) => {
                    let layer = tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file));
                    if format == "json" {
                        registry.with(layer.json()).init();
                    } else {
                        registry.with(layer).init();
                    }
                }
                Err(e) => {
                    registry.with(tracing_subscriber::fmt::layer()).init();
                    tracing::warn!("Cannot open log file {:?}: {}, logging to stderr", path, e);
                }
            }
        }
        ("json", None) => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    LogLevelControl { handle }
}
