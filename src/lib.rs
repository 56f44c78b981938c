//! Audio resampling stage for a media transcoding pipeline
//!
//! A [`Resampler`] accepts audio frames of an input track from any number
//! of producers, runs them through a filter graph on its own worker thread
//! and hands frames matching the output track to a completion callback.

pub mod config;
pub mod error;
pub mod filter;
pub mod pipeline;

pub use config::StageConfig;
pub use error::{ConfigError, ConfigureError, EngineError, StageError};
pub use filter::{FilterEngine, NativeEngine, Resampler};
pub use pipeline::{MediaFrame, MediaTrack, PipelineStage, StageState};
