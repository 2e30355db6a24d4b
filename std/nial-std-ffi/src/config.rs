///
/// # Bridge Configuration
///
/// Tunables for the handle table, call interfaces, and library lookup, read
/// from a TOML file. Every field has a default, so an empty file (or no file)
/// is a valid configuration.
///
/// ## Example
///
/// ```toml
/// [handles]
/// growth_chunk = 1024
/// max_slots = 1048576
///
/// [calls]
/// max_args = 128
///
/// [library]
/// search_paths = ["/opt/nial/lib"]
/// ```
///
/// The process-wide bridge reads the file named by `NIAL_FFI_CONFIG`, if set.
///

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_ENV_VAR: &str = "NIAL_FFI_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FfiConfig {
    pub handles: HandleConfig,
    pub calls: CallConfig,
    pub library: LibraryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandleConfig {
    /// Slots added each time the table runs out of free slots
    pub growth_chunk: usize,
    /// Upper bound on dynamic slots; allocation past it is `ResourceExhausted`
    pub max_slots: usize,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            growth_chunk: 1024,
            max_slots: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub max_args: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self { max_args: 128 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Directories tried, in order, for library names without a path separator
    pub search_paths: Vec<PathBuf>,
}

impl FfiConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FfiConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load from `NIAL_FFI_CONFIG`, falling back to defaults
    pub fn from_env() -> Self {
        let Some(path) = std::env::var_os(CONFIG_ENV_VAR) else {
            return Self::default();
        };
        match Self::load(Path::new(&path)) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring FFI config, using defaults");
                Self::default()
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.handles.growth_chunk == 0 {
            return Err(ConfigError::Invalid(
                "handles.growth_chunk must be at least 1".to_string(),
            ));
        }
        if self.calls.max_args == 0 {
            return Err(ConfigError::Invalid(
                "calls.max_args must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
