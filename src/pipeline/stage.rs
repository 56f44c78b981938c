//! Pipeline stage trait
//!
//! Defines the interface every filter stage exposes to the code wiring the
//! transcoding pipeline together.

use super::state::StageState;
use super::types::{MediaFrame, MediaTrack};
use crate::error::{ConfigureError, StageError};

/// Callback receiving each output frame of a stage, on the stage's worker thread
pub type CompleteHandler = Box<dyn FnMut(MediaFrame) + Send + 'static>;

/// A stage converting frames of one track format into another
pub trait PipelineStage: Send {
    /// Get the name of this stage for logging
    fn name(&self) -> &'static str;

    /// Prepare the stage for `input` frames producing `output` frames
    fn configure(&mut self, input: &MediaTrack, output: &MediaTrack) -> Result<(), ConfigureError>;

    /// Start processing queued frames
    fn start(&mut self) -> Result<(), StageError>;

    /// Stop processing and wait for in-flight work to finish
    fn stop(&mut self);

    /// Hand a frame to the stage. Never blocks.
    fn send_buffer(&self, frame: MediaFrame) -> Result<(), StageError>;

    fn state(&self) -> StageState;
}
