//! Loading pipeline definitions from INI files.
//!
//! Settings structs live in [`super::settings`], constants in
//! [`super::defaults`], and key mapping in [`super::parser`].

use std::path::Path;

use ini::Ini;
use thiserror::Error;

use super::settings::PipelineConfig;

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] ini::Error),

    /// Config text is not valid INI
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] ini::ParseError),

    /// Invalid configuration value
    #[error("Invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    /// Section name is not recognised
    #[error("Unknown configuration section [{0}]")]
    UnknownSection(String),
}

impl PipelineConfig {
    /// Load a pipeline definition from a specific path.
    ///
    /// Unlike settings files, a pipeline file must exist: there is no
    /// sensible default pipeline.
    pub fn load_from(path: &Path) -> Result<Self, ConfigFileError> {
        let ini = Ini::load_from_file(path)?;
        super::parser::parse_ini(&ini)
    }

    /// Parse a pipeline definition from INI text.
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigFileError> {
        let ini = Ini::load_from_str(text)?;
        super::parser::parse_ini(&ini)
    }
}
