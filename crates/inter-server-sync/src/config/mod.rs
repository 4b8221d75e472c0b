//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;
pub use validation::parse_since;

use std::path::Path;

use crate::error::Result;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Validate the configuration for an export run.
    pub fn validate_export(&self) -> Result<()> {
        validation::validate_export(self)
    }

    /// Validate the configuration for an import run.
    pub fn validate_import(&self) -> Result<()> {
        validation::validate_import(self)
    }
}
