//! Worker configuration (cadence.toml)
//!
//! ```toml
//! [worker]
//! name = "main"
//! quantum_ms = 500
//! owned_thread = true
//!
//! [engine]
//! max_pending = 65536
//! ```

use crate::engine::{EngineLimits, DEFAULT_MAX_PENDING};
use crate::worker::{WorkerOptions, DEFAULT_QUANTUM};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Semantically invalid value
    #[error("Invalid config: {0}")]
    Validation(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CadenceConfig {
    /// Worker settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

/// `[worker]` table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Diagnostic name
    #[serde(default = "default_worker_name")]
    pub name: String,

    /// Maximum time between engine steps, in milliseconds
    #[serde(default = "default_quantum_ms")]
    pub quantum_ms: u64,

    /// Spawn a dedicated thread
    #[serde(default = "default_owned_thread")]
    pub owned_thread: bool,
}

fn default_worker_name() -> String {
    "worker".to_string()
}

fn default_quantum_ms() -> u64 {
    DEFAULT_QUANTUM.as_millis() as u64
}

fn default_owned_thread() -> bool {
    true
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            quantum_ms: default_quantum_ms(),
            owned_thread: default_owned_thread(),
        }
    }
}

impl WorkerConfig {
    /// Worker options for this configuration
    pub fn to_options(&self) -> WorkerOptions {
        WorkerOptions::new(self.name.clone())
            .with_quantum(Duration::from_millis(self.quantum_ms))
            .with_owned_thread(self.owned_thread)
    }
}

/// `[engine]` table
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum outstanding registrations per engine
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

fn default_max_pending() -> usize {
    DEFAULT_MAX_PENDING
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
        }
    }
}

impl EngineConfig {
    /// Engine limits for this configuration
    pub fn to_limits(&self) -> EngineLimits {
        EngineLimits {
            max_pending: self.max_pending,
        }
    }
}

impl CadenceConfig {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: CadenceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.name.is_empty() {
            return Err(ConfigError::Validation(
                "worker.name cannot be empty".to_string(),
            ));
        }
        if self.worker.quantum_ms == 0 {
            return Err(ConfigError::Validation(
                "worker.quantum_ms must be greater than zero".to_string(),
            ));
        }
        if self.engine.max_pending == 0 {
            return Err(ConfigError::Validation(
                "engine.max_pending must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
