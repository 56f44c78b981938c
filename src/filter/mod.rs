//! Audio filter stage and the filter engines it drives
//!
//! The stage never touches samples itself. It hands frames to a
//! [`FilterEngine`], which owns the compiled filter graph, and forwards
//! whatever the engine's sink produces to the completion callback.

pub mod chain;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod native;
pub mod resampler;

pub use chain::{FilterChain, FilterNode, SourceParams};
#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegEngine;
pub use native::NativeEngine;
pub use resampler::Resampler;

use crate::error::EngineError;
use crate::pipeline::MediaFrame;

/// Result of draining the graph's sink
#[derive(Debug)]
pub enum Pull<F> {
    /// An output frame is ready
    Ready(F),
    /// More input is needed before the next frame
    NotReady,
    /// The graph was flushed and will not produce more frames
    EndOfStream,
    Error(EngineError),
}

/// A configured filter graph: source node, filter chain, sink node
///
/// Engines are driven from a single worker thread, so implementations need
/// `Send` but no internal synchronization.
pub trait FilterEngine: Send + 'static {
    /// Engine-side frame representation
    type Frame: Send;

    /// Build and validate the graph. `chain` uses FFmpeg filter syntax
    /// (see [`FilterChain`]). The graph runs single threaded.
    fn configure(&mut self, source: &SourceParams, chain: &str) -> Result<(), EngineError>;

    /// Convert a pipeline frame into the engine's representation
    fn import(&mut self, frame: MediaFrame) -> Result<Self::Frame, EngineError>;

    /// Feed a frame to the source node. The engine keeps its own copy of
    /// whatever it needs, the caller's frame stays untouched.
    fn push(&mut self, frame: &Self::Frame) -> Result<(), EngineError>;

    /// Take the next frame from the sink node
    fn pull(&mut self) -> Pull<Self::Frame>;

    /// Convert a sink frame back into a pipeline frame
    fn export(&mut self, frame: Self::Frame) -> Result<MediaFrame, EngineError>;

    /// Tear down the graph. Idempotent.
    fn release(&mut self);
}
