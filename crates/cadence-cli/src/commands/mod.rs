pub mod latency;
pub mod run;

use anyhow::Context;
use cadence_core::CadenceConfig;
use std::path::Path;

/// Load the config file (or defaults) and apply command-line overrides
pub fn load_config(path: Option<&Path>, quantum_ms: Option<u64>) -> anyhow::Result<CadenceConfig> {
    let mut config = match path {
        Some(path) => CadenceConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => CadenceConfig::default(),
    };
    if let Some(quantum_ms) = quantum_ms {
        config.worker.quantum_ms = quantum_ms;
    }
    config.validate()?;
    Ok(config)
}
