use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_QUEUE_ALIAS: &str = "Input queue of media resampler filter";
pub const DEFAULT_QUEUE_THRESHOLD: usize = 100;
pub const DEFAULT_THREAD_NAME: &str = "Resampler";
/// Maximum drift correction, in samples per second
pub const DEFAULT_ASYNC_COMPENSATION: u32 = 1000;

/// Tunables of a resampling stage
///
/// ```toml
/// queue_alias = "Input queue of media resampler filter"
/// queue_threshold = 100
/// thread_name = "Resampler"
/// async_compensation = 1000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Name of the input queue in diagnostics
    pub queue_alias: String,
    /// Backlog above which the input queue logs a warning
    pub queue_threshold: usize,
    /// Name given to the worker thread
    pub thread_name: String,
    pub async_compensation: u32,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            queue_alias: DEFAULT_QUEUE_ALIAS.to_string(),
            queue_threshold: DEFAULT_QUEUE_THRESHOLD,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            async_compensation: DEFAULT_ASYNC_COMPENSATION,
        }
    }
}

impl StageConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: StageConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Thread names cannot carry interior NULs
        if self.thread_name.is_empty() || self.thread_name.contains('\0') {
            return Err(ConfigError::Invalid(format!(
                "thread_name {:?} is not a valid thread name",
                self.thread_name
            )));
        }
        Ok(())
    }
}

/// Returns a version as specified in Cargo.toml
pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
