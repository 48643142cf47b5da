//! Configuration loading for the cluster binary.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct. A missing or malformed file is fatal at startup.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Number of nodes to construct. The cluster membership is fixed for
    /// the lifetime of the process.
    pub nodes_number: usize,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("unable to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Load the configuration from a YAML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}
