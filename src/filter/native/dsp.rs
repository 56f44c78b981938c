//! Sample-level building blocks of the native filter graph
//!
//! Samples travel through the graph as one `Vec<f32>` per channel in the
//! nominal [-1.0, 1.0] range; conversion from and to the packed
//! representation happens only at the graph edges.

use crate::pipeline::types::{SampleFormat, Timebase, Timestamp};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rubato::{
    FastFixedIn, PolynomialDegree, ResampleError, Resampler as RubatoResampler,
    ResamplerConstructionError,
};

pub type Planes = Vec<Vec<f32>>;

const U8_SCALE: f32 = 128.0;
const S16_SCALE: f32 = 32768.0;
const S32_SCALE: f64 = 2147483648.0;

/// Unpack `nb_samples` samples of `channels` channels into planes
///
/// `data` must hold exactly `nb_samples * channels * bytes_per_sample` bytes.
pub fn decode(mut data: &[u8], format: SampleFormat, channels: usize, nb_samples: usize) -> Planes {
    let mut planes = vec![Vec::with_capacity(nb_samples); channels];

    if format.is_planar() {
        for plane in planes.iter_mut() {
            for _ in 0..nb_samples {
                plane.push(read_sample(&mut data, format));
            }
        }
    } else {
        for _ in 0..nb_samples {
            for plane in planes.iter_mut() {
                plane.push(read_sample(&mut data, format));
            }
        }
    }
    planes
}

fn read_sample(data: &mut &[u8], format: SampleFormat) -> f32 {
    match format {
        SampleFormat::U8 | SampleFormat::U8p => (data.get_u8() as f32 - U8_SCALE) / U8_SCALE,
        SampleFormat::S16 | SampleFormat::S16p => data.get_i16_ne() as f32 / S16_SCALE,
        SampleFormat::S32 | SampleFormat::S32p => (data.get_i32_ne() as f64 / S32_SCALE) as f32,
        SampleFormat::Flt | SampleFormat::Fltp => data.get_f32_ne(),
        SampleFormat::Dbl | SampleFormat::Dblp => data.get_f64_ne() as f32,
    }
}

/// Pack planes into the given sample format
pub fn encode(planes: &[Vec<f32>], format: SampleFormat) -> Bytes {
    let nb_samples = planes.first().map_or(0, Vec::len);
    let mut buf = BytesMut::with_capacity(nb_samples * planes.len() * format.bytes_per_sample());

    if format.is_planar() {
        for plane in planes {
            for &sample in plane {
                write_sample(&mut buf, format, sample);
            }
        }
    } else {
        for i in 0..nb_samples {
            for plane in planes {
                write_sample(&mut buf, format, plane[i]);
            }
        }
    }
    buf.freeze()
}

fn write_sample(buf: &mut BytesMut, format: SampleFormat, sample: f32) {
    match format {
        SampleFormat::U8 | SampleFormat::U8p => {
            buf.put_u8((sample * U8_SCALE + U8_SCALE).round().clamp(0.0, 255.0) as u8)
        }
        SampleFormat::S16 | SampleFormat::S16p => {
            buf.put_i16_ne((sample * S16_SCALE).round().clamp(-32768.0, 32767.0) as i16)
        }
        SampleFormat::S32 | SampleFormat::S32p => buf.put_i32_ne(
            (sample as f64 * S32_SCALE)
                .round()
                .clamp(i32::MIN as f64, i32::MAX as f64) as i32,
        ),
        SampleFormat::Flt | SampleFormat::Fltp => buf.put_f32_ne(sample),
        SampleFormat::Dbl | SampleFormat::Dblp => buf.put_f64_ne(sample as f64),
    }
}

/// Map planes onto a different channel count.
///
/// Downmixing averages the input channels folding onto each output channel
/// (`input % output`); upmixing repeats input channels cyclically.
pub fn remix(planes: Planes, out_channels: usize) -> Planes {
    let in_channels = planes.len();
    if in_channels == out_channels || in_channels == 0 {
        return planes;
    }
    let nb_samples = planes[0].len();

    if out_channels > in_channels {
        return (0..out_channels)
            .map(|c| planes[c % in_channels].clone())
            .collect();
    }

    let mut out = vec![vec![0.0f32; nb_samples]; out_channels];
    for (c, target) in out.iter_mut().enumerate() {
        let sources: Vec<&Vec<f32>> = planes.iter().skip(c).step_by(out_channels).collect();
        let gain = 1.0 / sources.len() as f32;
        for source in sources {
            for (t, s) in target.iter_mut().zip(source) {
                *t += s * gain;
            }
        }
    }
    out
}

/// Streaming sample rate converter over rubato's polynomial resampler
///
/// Input is buffered until a full chunk is available. The resampler's
/// startup delay is cut from the output so the first output sample lines up
/// with the first input sample.
pub struct RateConverter {
    resampler: FastFixedIn<f32>,
    /// Input samples waiting for a full chunk, per channel
    pending: Planes,
    /// Output samples still to discard
    delay: usize,
    /// Output timestamp of the next produced sample, in 1/output_rate units
    next_pts: Option<i64>,
    output_rate: u32,
}

impl RateConverter {
    /// Input samples handed to rubato per call
    pub const CHUNK_FRAMES: usize = 256;

    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Result<Self, ResamplerConstructionError> {
        let resampler = FastFixedIn::<f32>::new(
            output_rate as f64 / input_rate as f64,
            1.0,
            PolynomialDegree::Septic,
            Self::CHUNK_FRAMES,
            channels,
        )?;
        let delay = resampler.output_delay();

        Ok(Self {
            resampler,
            pending: vec![Vec::new(); channels],
            delay,
            next_pts: None,
            output_rate,
        })
    }

    /// Input samples buffered and not yet converted
    pub fn buffered(&self) -> usize {
        self.pending.first().map_or(0, Vec::len)
    }

    /// Convert one block. Returns every output sample available so far and
    /// its timestamp in `pts.time_base`.
    pub fn process(&mut self, planes: Planes, pts: Timestamp) -> Result<(Planes, i64), ResampleError> {
        let time_base = pts.time_base;
        let rate_base = Timebase::from_sample_rate(self.output_rate);
        let next = *self
            .next_pts
            .get_or_insert_with(|| pts.rescale(rate_base).value);
        let out_pts = Timestamp::new(next, rate_base).rescale(time_base).value;

        for (pending, plane) in self.pending.iter_mut().zip(planes) {
            pending.extend(plane);
        }

        let mut out: Planes = vec![Vec::new(); self.pending.len()];
        loop {
            let needed = self.resampler.input_frames_next();
            if self.buffered() < needed {
                break;
            }
            let chunk: Planes = self
                .pending
                .iter_mut()
                .map(|pending| pending.drain(..needed).collect())
                .collect();

            let mut converted = self.resampler.process(&chunk, None)?;
            if self.delay > 0 {
                let cut = self.delay.min(converted.first().map_or(0, Vec::len));
                for plane in converted.iter_mut() {
                    plane.drain(..cut);
                }
                self.delay -= cut;
            }
            for (target, plane) in out.iter_mut().zip(converted) {
                target.extend(plane);
            }
        }

        let produced = out.first().map_or(0, Vec::len) as i64;
        self.next_pts = Some(next + produced);
        Ok((out, out_pts))
    }
}

/// Keeps a stream continuous against its timestamps by inserting silence
/// into gaps and trimming overlaps.
///
/// Corrections up to `min_hard_comp` seconds are rationed to `compensation`
/// samples per second of audio; larger jumps are corrected at once.
pub struct DriftCompensator {
    compensation: u32,
    sample_rate: u32,
    min_hard_comp: f64,
    /// Expected timestamp of the next sample, in 1/sample_rate units
    expected: Option<i64>,
}

impl DriftCompensator {
    pub fn new(compensation: u32, sample_rate: u32) -> Self {
        Self {
            compensation,
            sample_rate,
            min_hard_comp: 0.1,
            expected: None,
        }
    }

    /// Returns the corrected planes and their timestamp in `pts.time_base`
    pub fn process(&mut self, mut planes: Planes, pts: Timestamp) -> (Planes, i64) {
        let time_base = pts.time_base;
        let rate_base = Timebase::from_sample_rate(self.sample_rate);
        let actual = pts.rescale(rate_base).value;
        let nb_samples = planes.first().map_or(0, Vec::len);

        let expected = match self.expected {
            Some(expected) if self.compensation > 0 => expected,
            _ => {
                self.expected = Some(actual + nb_samples as i64);
                return (planes, pts.value);
            }
        };

        let delta = actual - expected;
        let hard_limit = (self.min_hard_comp * self.sample_rate as f64) as i64;
        let correction = if delta.abs() > hard_limit {
            delta
        } else {
            let budget = (self.compensation as u64 * nb_samples as u64 / self.sample_rate as u64).max(1) as i64;
            delta.clamp(-budget, budget)
        };

        if correction > 0 {
            for plane in planes.iter_mut() {
                plane.splice(0..0, std::iter::repeat_n(0.0, correction as usize));
            }
        } else if correction < 0 {
            let trim = (-correction as usize).min(nb_samples);
            for plane in planes.iter_mut() {
                plane.drain(..trim);
            }
        }

        let produced = planes.first().map_or(0, Vec::len) as i64;
        self.expected = Some(expected + produced);
        let out_pts = Timestamp::new(expected, rate_base).rescale(time_base).value;
        (planes, out_pts)
    }
}

/// Regroups a sample stream into blocks of exactly `samples` samples
pub struct Rebatcher {
    samples: usize,
    sample_rate: u32,
    buffer: Planes,
    /// Timestamp of the first buffered sample, in 1/sample_rate units
    next_pts: i64,
}

impl Rebatcher {
    pub fn new(samples: usize, sample_rate: u32, channels: usize) -> Self {
        Self {
            samples,
            sample_rate,
            buffer: vec![Vec::new(); channels],
            next_pts: 0,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.first().map_or(0, Vec::len)
    }

    /// Append a block and return every complete batch with its timestamp in
    /// `pts.time_base`
    pub fn process(&mut self, planes: Planes, pts: Timestamp) -> Vec<(Planes, i64)> {
        let time_base = pts.time_base;
        let rate_base = Timebase::from_sample_rate(self.sample_rate);
        if self.buffered() == 0 {
            self.next_pts = pts.rescale(rate_base).value;
        }

        for (buffer, plane) in self.buffer.iter_mut().zip(planes) {
            buffer.extend(plane);
        }

        let mut batches = Vec::new();
        while self.buffered() >= self.samples {
            let batch: Planes = self
                .buffer
                .iter_mut()
                .map(|buffer| buffer.drain(..self.samples).collect())
                .collect();
            let batch_pts = Timestamp::new(self.next_pts, rate_base).rescale(time_base).value;
            self.next_pts += self.samples as i64;
            batches.push((batch, batch_pts));
        }
        batches
    }
}
