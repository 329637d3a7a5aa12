use std::time::Duration;

/// Configuration for the selector and executor.
#[derive(Clone)]
pub struct Config {
    /// Number of executor worker threads. 0 = number of CPUs.
    pub worker_threads: usize,
    /// Granularity of the idle sweep; also the selector's poll timeout.
    pub sweep_interval: Duration,
    /// Maximum concurrently registered connections.
    pub max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            sweep_interval: Duration::from_millis(400),
            max_connections: 16_384,
        }
    }
}

impl Config {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.sweep_interval.is_zero() {
            return Err(crate::error::Error::IllegalState(
                "sweep_interval must be non-zero",
            ));
        }
        if self.max_connections == 0 {
            return Err(crate::error::Error::IllegalState(
                "max_connections must be > 0",
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with `build()` validation.
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of executor worker threads. 0 = number of CPUs.
    pub fn workers(mut self, n: usize) -> Self {
        self.config.worker_threads = n;
        self
    }

    /// Set the idle sweep granularity.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Set the maximum number of registered connections.
    pub fn max_connections(mut self, n: usize) -> Self {
        self.config.max_connections = n;
        self
    }

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_validates() {
        let config = ConfigBuilder::new()
            .workers(4)
            .max_connections(128)
            .sweep_interval(Duration::from_millis(100))
            .build()
            .unwrap();
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.max_connections, 128);

        assert!(ConfigBuilder::new()
            .sweep_interval(Duration::ZERO)
            .build()
            .is_err());
        assert!(ConfigBuilder::new().max_connections(0).build().is_err());
    }
}
