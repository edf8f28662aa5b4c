//! Cluster configuration.

use serde::{Deserialize, Serialize};

/// Default buffer size for every subscription in the cluster.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Environment variable overriding [`ClusterConfig::bus_capacity`].
pub const BUS_CAPACITY_ENV: &str = "LAB_BUS_CAPACITY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Events each subscription buffers before emitters wait for the
    /// subscriber to catch up. Applies to membership events, state diffs and
    /// per-host connectivity streams.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bus_capacity: default_bus_capacity(),
        }
    }
}

impl ClusterConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// - `LAB_BUS_CAPACITY`: positive integer
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(BUS_CAPACITY_ENV) {
            config.bus_capacity = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidCapacity(value.clone()))?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus_capacity == 0 {
            return Err(ConfigError::InvalidCapacity("0".into()));
        }
        Ok(())
    }
}

fn default_bus_capacity() -> usize {
    DEFAULT_BUS_CAPACITY
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid bus capacity {0:?}: expected a positive integer")]
    InvalidCapacity(String),
}
