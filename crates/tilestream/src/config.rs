//! Loader configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tilestream_decode::DecodeOptions;

use crate::error::{Error, Result};

/// Tunables for a [`TileContentLoader`](crate::TileContentLoader).
///
/// Every field has a default, so a config file only needs the fields it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    /// Target number of cached entries. Entries with waiting consumers are
    /// never evicted, so the cache may hold more.
    pub cache_size: usize,
    /// Maximum number of fetches in flight.
    pub batch_size: usize,
    /// Period of the fetch driver.
    pub fetch_interval_ms: u64,
    /// Period of the delivery driver.
    pub delivery_interval_ms: u64,
    /// Time the delivery driver may spend running back-to-back ticks.
    pub delivery_budget_ms: u64,
    /// Fail on unsupported versions and on any validation finding.
    pub strict: bool,
    /// Fail containers whose feature table has no `BATCH_LENGTH`.
    pub require_batch_length: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            cache_size: 256,
            batch_size: 8,
            fetch_interval_ms: 16,
            delivery_interval_ms: 16,
            delivery_budget_ms: 8,
            strict: false,
            require_batch_length: true,
        }
    }
}

impl LoaderConfig {
    /// Parse a config from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the JSON is malformed, has unknown
    /// fields, or describes an invalid config.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| Error::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, otherwise as
    /// [`LoaderConfig::from_json_str`].
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Check that the config can drive a loader.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `batch_size` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config {
                message: "batch_size must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_fetch_interval(mut self, interval: Duration) -> Self {
        self.fetch_interval_ms = duration_ms(interval);
        self
    }

    #[must_use]
    pub fn with_delivery_interval(mut self, interval: Duration) -> Self {
        self.delivery_interval_ms = duration_ms(interval);
        self
    }

    #[must_use]
    pub fn with_delivery_budget(mut self, budget: Duration) -> Self {
        self.delivery_budget_ms = duration_ms(budget);
        self
    }

    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    #[must_use]
    pub fn with_require_batch_length(mut self, require: bool) -> Self {
        self.require_batch_length = require;
        self
    }

    #[must_use]
    pub fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_interval_ms)
    }

    #[must_use]
    pub fn delivery_interval(&self) -> Duration {
        Duration::from_millis(self.delivery_interval_ms)
    }

    #[must_use]
    pub fn delivery_budget(&self) -> Duration {
        Duration::from_millis(self.delivery_budget_ms)
    }

    /// Decoder options derived from this config.
    #[must_use]
    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            strict: self.strict,
            require_batch_length: self.require_batch_length,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
