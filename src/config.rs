//! Engine configuration.
//!
//! Loaded from a TOML file by the CLI; embedders usually start from
//! `EngineConfig::default()`.
//!
//! ```toml
//! initial_context_stack_words = 4096
//! max_context_stack_words = 1048576
//! verify_bytecode = true
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Engine-wide settings shared by every context.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Minimum size in words of a context's first stack block.
    pub initial_context_stack_words: u32,
    /// Ceiling on a context's total stack memory in words (0 = unlimited).
    pub max_context_stack_words: u32,
    /// Run the bytecode verifier when modules are built.
    pub verify_bytecode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_context_stack_words: 1024,
            max_context_stack_words: 0,
            verify_bytecode: true,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
