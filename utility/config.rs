use crate::estimate::UtilityOptions;
use crate::loss::LossSpec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Errors raised while building, loading, or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value {value} for '{parameter}': {requirement}.")]
    InvalidParameter {
        parameter: &'static str,
        value: f64,
        requirement: &'static str,
    },
    #[error("Market weight vector has {found} entries, but rate vectors have {expected} nodes.")]
    MarketLength { found: usize, expected: usize },
    #[error("Draw index {index} is out of range for {len} draws.")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Unknown {kind} '{name}'.")]
    UnknownName { kind: &'static str, name: String },
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Loss specification and estimator options for one study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilityConfig {
    pub loss: LossSpec,
    #[serde(default)]
    pub options: UtilityOptions,
}

impl UtilityConfig {
    pub fn new(loss: LossSpec, options: UtilityOptions) -> Result<Self, ConfigError> {
        let config = Self { loss, options };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.loss.validate()?;
        self.options.validate()
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Saves the configuration in a human-readable TOML format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let toml_string = self.to_toml_string()?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads and validates a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        Self::from_toml_str(&toml_string)
    }
}
