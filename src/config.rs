pub use config::{Config, Environment, File as ConfigFile};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{BatchError, Result};
use crate::telemetry::TelemetryConfig;

/// Flush period used when none is configured
pub const DEFAULT_FLUSH_AFTER_MS: u64 = 5000;

/// Options recognized by the batch
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Flush period in milliseconds
    pub flush_after_ms: u64,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            flush_after_ms: DEFAULT_FLUSH_AFTER_MS,
        }
    }
}

impl BatchOptions {
    pub fn with_flush_after(flush_after: Duration) -> Self {
        Self {
            flush_after_ms: u64::try_from(flush_after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn flush_after(&self) -> Duration {
        Duration::from_millis(self.flush_after_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.flush_after_ms == 0 {
            return Err(BatchError::InvalidFlushInterval);
        }
        Ok(())
    }
}

/// Process-level settings: batch options plus logging
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub batch: BatchOptions,
    pub telemetry: TelemetryConfig,
}

impl Settings {
    /// Layer an optional TOML file and `REDIS_BATCH__*` environment variables
    ///
    /// `REDIS_BATCH__BATCH__FLUSH_AFTER_MS=250` overrides `[batch] flush_after_ms`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(ConfigFile::from(path).required(true));
        }
        builder = builder.add_source(Environment::with_prefix("REDIS_BATCH").separator("__"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.batch.validate()?;
        Ok(settings)
    }
}
