//! Pipeline building blocks shared by filter stages
//!
//! - Types: tracks, frames, timebases and sample formats
//! - State: lifecycle state machine of a stage
//! - Queue: blocking frame queue between producers and a stage worker
//! - Health: counters and alerts for dropped frames and worker failures

pub mod health;
pub mod queue;
pub mod stage;
pub mod state;
pub mod types;

pub use health::{HealthAlert, HealthMonitor, StageHealth};
pub use queue::FrameQueue;
pub use stage::{CompleteHandler, PipelineStage};
pub use state::StageState;
pub use types::{ChannelLayout, MediaFrame, MediaKind, MediaTrack, SampleFormat, Timebase, Timestamp};
