//! YAML configuration parsing.

use std::path::Path;

use super::error::ConfigError;
use super::types::ServerConfig;

/// Loads and validates server configuration from YAML.
pub struct YamlLoader;

impl YamlLoader {
    /// Parse a server configuration file.
    pub fn load_server_config(path: impl AsRef<Path>) -> Result<ServerConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: ServerConfig = Self::deserialize(&content).map_err(|e| match e {
            ConfigError::YamlError(source) => ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse server configuration from a YAML string.
    pub fn parse_server_config(yaml: &str) -> Result<ServerConfig, ConfigError> {
        let config = Self::deserialize(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn deserialize(yaml: &str) -> Result<ServerConfig, ConfigError> {
        // An empty document deserializes as null, not as an empty mapping.
        if yaml.trim().is_empty() {
            return Ok(ServerConfig::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }
}
