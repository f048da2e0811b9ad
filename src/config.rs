use std::time::Duration;

use crate::error::{Error, Result};
use crate::size_class::{DEFAULT_DRAIN_PERIOD, DEFAULT_REFILL_COUNT};

/// Runtime knobs for a [`PoolAllocator`](crate::PoolAllocator).
///
/// The size-class layout itself is fixed at build time; see
/// [`size_class`](crate::size_class).
#[derive(Debug, Clone)]
pub struct Config {
    /// How many blocks to carve when refilling an empty free list.
    pub refill_count: usize,

    /// How often the background thread drains the deferred-free queue.
    pub drain_period: Duration,

    /// The name given to the background drainer thread.
    pub drainer_thread_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refill_count: DEFAULT_REFILL_COUNT,
            drain_period: DEFAULT_DRAIN_PERIOD,
            drainer_thread_name: "deferred-free-drainer".to_string(),
        }
    }
}

impl Config {
    /// Start building a configuration from the defaults.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        if self.refill_count == 0 {
            return Err(Error::config("refill_count must be > 0"));
        }

        if self.drain_period.is_zero() {
            return Err(Error::config("drain_period must be > 0"));
        }

        if self.drainer_thread_name.contains('\0') {
            return Err(Error::config("drainer_thread_name must not contain NUL"));
        }

        Ok(())
    }
}

/// Builder for [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// A builder starting from [`Config::default`].
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the number of blocks carved per refill.
    pub fn refill_count(mut self, count: usize) -> Self {
        self.config.refill_count = count;
        self
    }

    /// Set the deferred-free drain period.
    pub fn drain_period(mut self, period: Duration) -> Self {
        self.config.drain_period = period;
        self
    }

    /// Set the drainer thread's name.
    pub fn drainer_thread_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.drainer_thread_name = name.into();
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
