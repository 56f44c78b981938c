//! Filter engine backed by libswresample through `ac-ffmpeg`
//!
//! `aresample`, `aformat` and `asetnsamples` map onto a single
//! [`AudioResampler`]. `asettb` is applied when stamping output frames.
//! Drift compensation is not available through this backend and the
//! `aresample=async` node is accepted but skipped.

use super::chain::{FilterChain, FilterNode, SourceParams};
use super::{FilterEngine, Pull};
use crate::error::EngineError;
use crate::pipeline::types::{ChannelLayout, MediaFrame, MediaKind, SampleFormat, Timebase};
use ac_ffmpeg::codec::audio::frame::get_sample_format;
use ac_ffmpeg::codec::audio::{self, AudioFrame, AudioFrameMut, AudioResampler};
use ac_ffmpeg::time::{TimeBase, Timestamp};
use bytes::BytesMut;
use log::{debug, warn};

fn to_ffmpeg_format(format: SampleFormat) -> audio::SampleFormat {
    get_sample_format(format.name())
}

fn to_ffmpeg_layout(layout: ChannelLayout) -> Result<audio::ChannelLayout, EngineError> {
    layout
        .name()
        .parse::<audio::ChannelLayout>()
        .map_err(|_| EngineError::InvalidParameter(format!("channel layout {}", layout)))
}

fn to_ffmpeg_time_base(time_base: Timebase) -> TimeBase {
    TimeBase::new(time_base.num, time_base.den)
}

/// Output side of the graph, resolved from the chain
struct Target {
    time_base: Timebase,
    sample_rate: u32,
    sample_format: SampleFormat,
    channel_layout: ChannelLayout,
}

struct Graph {
    source: SourceParams,
    target: Target,
    resampler: AudioResampler,
    /// Timestamp of the next output sample, in 1/target rate units
    next_pts: Option<i64>,
}

/// Filter engine running on FFmpeg's resampler
#[derive(Default)]
pub struct FfmpegEngine {
    graph: Option<Graph>,
}

impl FfmpegEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn graph(&mut self) -> Result<&mut Graph, EngineError> {
        self.graph.as_mut().ok_or(EngineError::NotConfigured)
    }
}

impl FilterEngine for FfmpegEngine {
    type Frame = AudioFrame;

    fn configure(&mut self, source: &SourceParams, chain: &str) -> Result<(), EngineError> {
        self.release();
        let chain: FilterChain = chain.parse()?;

        let mut target = Target {
            time_base: source.time_base,
            sample_rate: source.sample_rate,
            sample_format: source.sample_format,
            channel_layout: source.channel_layout,
        };
        let mut frame_samples = None;

        for node in chain.nodes() {
            match *node {
                FilterNode::SetTimebase(time_base) => target.time_base = time_base,
                FilterNode::AsyncResample { compensation } => {
                    if compensation > 0 {
                        warn!("Drift compensation is not supported by the FFmpeg engine, ignoring");
                    }
                }
                FilterNode::Resample { sample_rate } => target.sample_rate = sample_rate,
                FilterNode::Format {
                    sample_format,
                    channel_layout,
                } => {
                    target.sample_format = sample_format.unwrap_or(target.sample_format);
                    target.channel_layout = channel_layout.unwrap_or(target.channel_layout);
                }
                FilterNode::SetSamples { samples } => frame_samples = Some(samples),
            }
        }

        let resampler = AudioResampler::builder()
            .source_channel_layout(to_ffmpeg_layout(source.channel_layout)?)
            .source_sample_format(to_ffmpeg_format(source.sample_format))
            .source_sample_rate(source.sample_rate)
            .target_channel_layout(to_ffmpeg_layout(target.channel_layout)?)
            .target_sample_format(to_ffmpeg_format(target.sample_format))
            .target_sample_rate(target.sample_rate)
            .target_frame_samples(frame_samples)
            .build()
            .map_err(|e| EngineError::Backend(e.to_string()))?;

        debug!("FFmpeg filter graph: {} -> {}", source, chain);

        self.graph = Some(Graph {
            source: source.clone(),
            target,
            resampler,
            next_pts: None,
        });
        Ok(())
    }

    fn import(&mut self, frame: MediaFrame) -> Result<AudioFrame, EngineError> {
        self.graph()?;

        if frame.kind != MediaKind::Audio {
            return Err(EngineError::FormatMismatch(format!(
                "{:?} frame in an audio graph",
                frame.kind
            )));
        }
        if frame.size() != frame.expected_size() {
            return Err(EngineError::FormatMismatch(format!(
                "{} bytes for {} samples, expected {}",
                frame.size(),
                frame.nb_samples,
                frame.expected_size()
            )));
        }

        let layout = to_ffmpeg_layout(frame.channel_layout)?;
        let mut out = AudioFrameMut::silence(
            &layout,
            to_ffmpeg_format(frame.sample_format),
            frame.sample_rate,
            frame.nb_samples,
        );

        let planes = if frame.sample_format.is_planar() {
            frame.channel_layout.channels()
        } else {
            1
        };
        let plane_size = frame.size() / planes;
        for (i, plane) in out.planes_mut().iter_mut().enumerate().take(planes) {
            let src = &frame.data[i * plane_size..(i + 1) * plane_size];
            plane.data_mut()[..plane_size].copy_from_slice(src);
        }

        let pts = Timestamp::new(frame.pts, to_ffmpeg_time_base(frame.time_base));
        Ok(out.freeze().with_pts(pts))
    }

    fn push(&mut self, frame: &AudioFrame) -> Result<(), EngineError> {
        let graph = self.graph()?;
        if frame.sample_rate() != graph.source.sample_rate {
            return Err(EngineError::FormatMismatch(format!(
                "frame is {} Hz, graph expects {}",
                frame.sample_rate(),
                graph.source
            )));
        }

        if graph.next_pts.is_none() {
            let rate_base = TimeBase::new(1, graph.target.sample_rate as i32);
            graph.next_pts = Some(frame.pts().with_time_base(rate_base).timestamp());
        }

        graph
            .resampler
            .push(frame.clone())
            .map_err(|e| EngineError::FormatMismatch(e.to_string()))
    }

    fn pull(&mut self) -> Pull<AudioFrame> {
        let Some(graph) = self.graph.as_mut() else {
            return Pull::Error(EngineError::NotConfigured);
        };

        match graph.resampler.take() {
            Ok(Some(frame)) => {
                let rate_base = TimeBase::new(1, graph.target.sample_rate as i32);
                let next = graph.next_pts.unwrap_or(0);
                graph.next_pts = Some(next + frame.samples() as i64);
                let pts = Timestamp::new(next, rate_base)
                    .with_time_base(to_ffmpeg_time_base(graph.target.time_base));
                Pull::Ready(frame.with_pts(pts))
            }
            Ok(None) => Pull::NotReady,
            Err(e) => Pull::Error(EngineError::Backend(e.to_string())),
        }
    }

    fn export(&mut self, frame: AudioFrame) -> Result<MediaFrame, EngineError> {
        let graph = self.graph()?;
        let target = &graph.target;

        let channels = target.channel_layout.channels();
        let samples = frame.samples();
        let (planes, plane_size) = if target.sample_format.is_planar() {
            (channels, samples * target.sample_format.bytes_per_sample())
        } else {
            (1, samples * channels * target.sample_format.bytes_per_sample())
        };

        let mut data = BytesMut::with_capacity(planes * plane_size);
        for plane in frame.planes().iter().take(planes) {
            let bytes = plane.data();
            if bytes.len() < plane_size {
                return Err(EngineError::Backend(format!(
                    "plane holds {} bytes, expected {}",
                    bytes.len(),
                    plane_size
                )));
            }
            data.extend_from_slice(&bytes[..plane_size]);
        }

        Ok(MediaFrame::audio(
            data.freeze(),
            frame.pts().timestamp(),
            target.time_base,
            target.sample_rate,
            target.sample_format,
            target.channel_layout,
            samples,
        ))
    }

    fn release(&mut self) {
        if self.graph.take().is_some() {
            debug!("FFmpeg filter graph released");
        }
    }
}
