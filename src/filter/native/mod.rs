//! Pure Rust filter engine
//!
//! Builds the graph described by a [`FilterChain`] out of the sample
//! processors in [`dsp`]. Every node runs inline on the caller's thread.

pub mod dsp;

use super::chain::{FilterChain, FilterNode, SourceParams};
use super::{FilterEngine, Pull};
use crate::error::EngineError;
use crate::pipeline::types::{ChannelLayout, MediaFrame, MediaKind, SampleFormat, Timebase, Timestamp};
use dsp::{DriftCompensator, Planes, RateConverter, Rebatcher};
use log::{debug, trace};
use std::collections::VecDeque;

/// Decoded audio block travelling through the native graph
#[derive(Debug, Clone)]
pub struct NativeFrame {
    pts: i64,
    time_base: Timebase,
    sample_rate: u32,
    sample_format: SampleFormat,
    channel_layout: ChannelLayout,
    planes: Planes,
}

impl NativeFrame {
    pub fn pts(&self) -> i64 {
        self.pts
    }

    pub fn time_base(&self) -> Timebase {
        self.time_base
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn sample_format(&self) -> SampleFormat {
        self.sample_format
    }

    pub fn channel_layout(&self) -> ChannelLayout {
        self.channel_layout
    }

    pub fn nb_samples(&self) -> usize {
        self.planes.first().map_or(0, Vec::len)
    }

    /// One `f32` plane per channel
    pub fn planes(&self) -> &[Vec<f32>] {
        &self.planes
    }

    fn timestamp(&self) -> Timestamp {
        Timestamp::new(self.pts, self.time_base)
    }
}

enum Node {
    SetTimebase(Timebase),
    Compensate(DriftCompensator),
    Resample {
        /// None when input and output rates match
        converter: Option<RateConverter>,
        sample_rate: u32,
    },
    Format {
        sample_format: SampleFormat,
        channel_layout: ChannelLayout,
    },
    Rebatch(Rebatcher),
}

impl Node {
    fn process(&mut self, mut frame: NativeFrame) -> Result<Vec<NativeFrame>, EngineError> {
        let frames = match self {
            Node::SetTimebase(time_base) => {
                frame.pts = frame.timestamp().rescale(*time_base).value;
                frame.time_base = *time_base;
                vec![frame]
            }
            Node::Compensate(compensator) => {
                let ts = frame.timestamp();
                let (planes, pts) = compensator.process(std::mem::take(&mut frame.planes), ts);
                frame.planes = planes;
                frame.pts = pts;
                vec![frame]
            }
            Node::Resample {
                converter,
                sample_rate,
            } => {
                if let Some(converter) = converter {
                    let ts = frame.timestamp();
                    let (planes, pts) = converter
                        .process(std::mem::take(&mut frame.planes), ts)
                        .map_err(|e| EngineError::Backend(format!("aresample: {}", e)))?;
                    frame.planes = planes;
                    frame.pts = pts;
                }
                frame.sample_rate = *sample_rate;
                vec![frame]
            }
            Node::Format {
                sample_format,
                channel_layout,
            } => {
                if frame.channel_layout != *channel_layout {
                    frame.planes = dsp::remix(std::mem::take(&mut frame.planes), channel_layout.channels());
                    frame.channel_layout = *channel_layout;
                }
                frame.sample_format = *sample_format;
                vec![frame]
            }
            Node::Rebatch(rebatcher) => {
                let ts = frame.timestamp();
                rebatcher
                    .process(std::mem::take(&mut frame.planes), ts)
                    .into_iter()
                    .map(|(planes, pts)| NativeFrame {
                        pts,
                        planes,
                        ..frame.clone()
                    })
                    .collect()
            }
        };
        Ok(frames)
    }
}

struct Graph {
    source: SourceParams,
    nodes: Vec<Node>,
    sink: VecDeque<NativeFrame>,
}

impl Graph {
    fn build(source: &SourceParams, chain: &FilterChain) -> Result<Self, EngineError> {
        if !source.time_base.is_valid() {
            return Err(EngineError::InvalidParameter(format!(
                "source time_base {}",
                source.time_base
            )));
        }
        if source.sample_rate == 0 {
            return Err(EngineError::InvalidParameter("source sample_rate 0".to_string()));
        }

        // Format of the stream at the current point of the chain
        let mut sample_rate = source.sample_rate;
        let mut sample_format = source.sample_format;
        let mut channel_layout = source.channel_layout;

        let mut nodes = Vec::with_capacity(chain.nodes().len());
        for node in chain.nodes() {
            let node = match *node {
                FilterNode::SetTimebase(time_base) => Node::SetTimebase(time_base),
                FilterNode::AsyncResample { compensation } => {
                    Node::Compensate(DriftCompensator::new(compensation, sample_rate))
                }
                FilterNode::Resample {
                    sample_rate: target,
                } => {
                    let converter = if target == sample_rate {
                        None
                    } else {
                        let converter = RateConverter::new(sample_rate, target, channel_layout.channels())
                            .map_err(|e| {
                                EngineError::InvalidParameter(format!(
                                    "aresample {} -> {}: {}",
                                    sample_rate, target, e
                                ))
                            })?;
                        Some(converter)
                    };
                    sample_rate = target;
                    Node::Resample {
                        converter,
                        sample_rate: target,
                    }
                }
                FilterNode::Format {
                    sample_format: format,
                    channel_layout: layout,
                } => {
                    sample_format = format.unwrap_or(sample_format);
                    channel_layout = layout.unwrap_or(channel_layout);
                    Node::Format {
                        sample_format,
                        channel_layout,
                    }
                }
                FilterNode::SetSamples { samples } => {
                    Node::Rebatch(Rebatcher::new(samples, sample_rate, channel_layout.channels()))
                }
            };
            nodes.push(node);
        }

        debug!(
            "Native filter graph: {} -> {} -> {} Hz {} {}",
            source, chain, sample_rate, sample_format, channel_layout
        );

        Ok(Self {
            source: source.clone(),
            nodes,
            sink: VecDeque::new(),
        })
    }

    fn run(&mut self, frame: NativeFrame) -> Result<(), EngineError> {
        let mut frames = vec![frame];
        for node in self.nodes.iter_mut() {
            let mut next = Vec::with_capacity(frames.len());
            for frame in frames {
                next.extend(
                    node.process(frame)?
                        .into_iter()
                        .filter(|frame| frame.nb_samples() > 0),
                );
            }
            if next.is_empty() {
                return Ok(());
            }
            frames = next;
        }
        trace!("Native filter graph produced {} frame(s)", frames.len());
        self.sink.extend(frames);
        Ok(())
    }
}

/// Filter engine running the graph in plain Rust
#[derive(Default)]
pub struct NativeEngine {
    graph: Option<Graph>,
}

impl NativeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_configured(&self) -> bool {
        self.graph.is_some()
    }

    /// Output frames waiting in the sink
    pub fn pending(&self) -> usize {
        self.graph.as_ref().map_or(0, |graph| graph.sink.len())
    }

    fn graph(&mut self) -> Result<&mut Graph, EngineError> {
        self.graph.as_mut().ok_or(EngineError::NotConfigured)
    }
}

impl FilterEngine for NativeEngine {
    type Frame = NativeFrame;

    fn configure(&mut self, source: &SourceParams, chain: &str) -> Result<(), EngineError> {
        self.release();
        let chain: FilterChain = chain.parse()?;
        self.graph = Some(Graph::build(source, &chain)?);
        Ok(())
    }

    fn import(&mut self, frame: MediaFrame) -> Result<NativeFrame, EngineError> {
        self.graph()?;

        if frame.kind != MediaKind::Audio {
            return Err(EngineError::FormatMismatch(format!(
                "{:?} frame in an audio graph",
                frame.kind
            )));
        }
        if frame.size() != frame.expected_size() {
            return Err(EngineError::FormatMismatch(format!(
                "{} bytes for {} samples of {} {}, expected {}",
                frame.size(),
                frame.nb_samples,
                frame.sample_format,
                frame.channel_layout,
                frame.expected_size()
            )));
        }

        let planes = dsp::decode(
            &frame.data,
            frame.sample_format,
            frame.channel_layout.channels(),
            frame.nb_samples,
        );
        Ok(NativeFrame {
            pts: frame.pts,
            time_base: frame.time_base,
            sample_rate: frame.sample_rate,
            sample_format: frame.sample_format,
            channel_layout: frame.channel_layout,
            planes,
        })
    }

    fn push(&mut self, frame: &NativeFrame) -> Result<(), EngineError> {
        let graph = self.graph()?;
        let source = &graph.source;

        // The source node cannot change properties on the fly
        if frame.sample_rate != source.sample_rate
            || frame.sample_format != source.sample_format
            || frame.channel_layout != source.channel_layout
        {
            return Err(EngineError::FormatMismatch(format!(
                "frame is {} Hz {} {}, graph expects {}",
                frame.sample_rate, frame.sample_format, frame.channel_layout, source
            )));
        }

        let mut frame = frame.clone();
        if frame.time_base != source.time_base {
            frame.pts = frame.timestamp().rescale(source.time_base).value;
            frame.time_base = source.time_base;
        }
        graph.run(frame)
    }

    fn pull(&mut self) -> Pull<NativeFrame> {
        match self.graph.as_mut() {
            None => Pull::Error(EngineError::NotConfigured),
            Some(graph) => match graph.sink.pop_front() {
                Some(frame) => Pull::Ready(frame),
                None => Pull::NotReady,
            },
        }
    }

    fn export(&mut self, frame: NativeFrame) -> Result<MediaFrame, EngineError> {
        let data = dsp::encode(&frame.planes, frame.sample_format);
        Ok(MediaFrame::audio(
            data,
            frame.pts,
            frame.time_base,
            frame.sample_rate,
            frame.sample_format,
            frame.channel_layout,
            frame.nb_samples(),
        ))
    }

    fn release(&mut self) {
        if let Some(graph) = self.graph.take() {
            debug!(
                "Native filter graph released with {} frame(s) unread",
                graph.sink.len()
            );
        }
    }
}
