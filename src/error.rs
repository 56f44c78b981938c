//! Error types for the resampling stage

use crate::pipeline::StageState;
use thiserror::Error;

/// Error reported by a filter engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine has not been configured (or was released)
    #[error("Filter graph is not configured")]
    NotConfigured,

    /// The chain description could not be parsed
    #[error(transparent)]
    ChainParse(#[from] ChainParseError),

    /// A parameter was rejected while building the graph
    #[error("Invalid filter parameter: {0}")]
    InvalidParameter(String),

    /// A frame does not match the format the graph was configured for
    #[error("Frame format mismatch: {0}")]
    FormatMismatch(String),

    /// Backend specific failure
    #[error("Filter engine error: {0}")]
    Backend(String),
}

/// Error produced while parsing a filter chain description
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainParseError {
    #[error("Empty filter chain")]
    Empty,

    #[error("Unknown filter: {0}")]
    UnknownFilter(String),

    #[error("Invalid argument for {filter}: {arg:?}")]
    InvalidArgument { filter: &'static str, arg: String },
}

/// Error returned by `configure`
#[derive(Error, Debug)]
pub enum ConfigureError {
    #[error("Cannot configure while {0}")]
    InvalidState(StageState),

    #[error("Track #{track} is missing {field}")]
    IncompleteTrack { track: u32, field: &'static str },

    #[error("Invalid timebase: input: {input}, output: {output}")]
    InvalidTimebase { input: String, output: String },

    #[error("Could not parse filter string for resampling: {source} ({chain})")]
    ChainParse {
        chain: String,
        #[source]
        source: ChainParseError,
    },

    #[error("Could not create filter graph for resampling: {0}")]
    Engine(#[source] EngineError),

    /// The engine was lost when the worker panicked
    #[error("Filter engine is no longer available")]
    EngineUnavailable,
}

/// Lifecycle misuse or worker startup failure
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Stage is not configured (state: {0})")]
    NotConfigured(StageState),

    #[error("Stage is already running")]
    AlreadyRunning,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Invalid stage configuration: {0}")]
    Config(#[source] ConfigError),
}

/// Configuration loading error
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
