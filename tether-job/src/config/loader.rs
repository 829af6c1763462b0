//! Configuration loader

use std::path::Path;

use tether_utils::{config_file, Result, TetherError};

use super::JobConfig;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from default location
    pub fn load() -> Result<JobConfig> {
        let path = config_file();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Ok(JobConfig::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<JobConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| TetherError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path)
    }

    /// Parse configuration from string
    pub fn parse(content: &str, path: &Path) -> Result<JobConfig> {
        toml::from_str(content).map_err(|e| TetherError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(config: &JobConfig) -> Result<()> {
        let stream = &config.stream;
        if stream.cwnd_size == 0 {
            return Err(TetherError::config("cwnd_size must be greater than 0"));
        }
        if stream.cwnd_size > stream.buffer_size {
            return Err(TetherError::config(
                "cwnd_size must not exceed buffer_size",
            ));
        }
        if stream.max_packet_size == 0 {
            return Err(TetherError::config("max_packet_size must be greater than 0"));
        }
        if stream.read_chunk_size == 0 {
            return Err(TetherError::config("read_chunk_size must be greater than 0"));
        }

        if config.input.reorder_capacity == 0 {
            return Err(TetherError::config("reorder_capacity must be greater than 0"));
        }

        Ok(())
    }

    /// Load from an explicit path, or the default location, and validate
    pub fn load_and_validate(path: Option<&Path>) -> Result<JobConfig> {
        let config = match path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::load()?,
        };
        Self::validate(&config)?;
        Ok(config)
    }
}
