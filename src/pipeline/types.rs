//! Core types for the pipeline system

use bytes::Bytes;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a media type name cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseMediaError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseMediaError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Rational unit of time in which a stream's timestamps are expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timebase {
    pub num: i32,
    pub den: i32,
}

impl Timebase {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Timebase of one tick per sample at the given rate
    pub fn from_sample_rate(sample_rate: u32) -> Self {
        Self::new(1, sample_rate as i32)
    }

    /// A timebase is usable when neither side is zero
    pub fn is_valid(&self) -> bool {
        self.num != 0 && self.den != 0
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Ratio `self / other` as a real number.
    ///
    /// Computed as `(self.num * other.den) / (self.den * other.num)`, so a zero
    /// in the divisor yields an infinite or NaN result instead of a panic.
    pub fn ratio(&self, other: Timebase) -> f64 {
        let num = self.num as i64 * other.den as i64;
        let den = self.den as i64 * other.num as i64;
        num as f64 / den as f64
    }
}

impl std::fmt::Display for Timebase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for Timebase {
    type Err = ParseMediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (num, den) = s
            .split_once('/')
            .ok_or_else(|| ParseMediaError::new("timebase", s))?;
        let num = num
            .trim()
            .parse()
            .map_err(|_| ParseMediaError::new("timebase", s))?;
        let den = den
            .trim()
            .parse()
            .map_err(|_| ParseMediaError::new("timebase", s))?;
        Ok(Self { num, den })
    }
}

/// Timestamp representation for media frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    /// Tick count in `time_base` units
    pub value: i64,
    pub time_base: Timebase,
}

impl Timestamp {
    pub fn new(value: i64, time_base: Timebase) -> Self {
        Self { value, time_base }
    }

    /// Convert to another timebase, rounding to the nearest tick
    pub fn rescale(&self, to: Timebase) -> Self {
        if self.time_base == to {
            return *self;
        }
        let num = self.value as i128 * self.time_base.num as i128 * to.den as i128;
        let den = self.time_base.den as i128 * to.num as i128;
        let value = if den == 0 { 0 } else { div_round(num, den) };
        Self {
            value: value as i64,
            time_base: to,
        }
    }

    /// Timestamp in seconds
    pub fn as_secs_f64(&self) -> f64 {
        self.value as f64 * self.time_base.as_f64()
    }
}

fn div_round(num: i128, den: i128) -> i128 {
    let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
    if num >= 0 {
        (num + den / 2) / den
    } else {
        (num - den / 2) / den
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.value, self.time_base)
    }
}

/// Kind of media data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// Video frame data
    Video,
    /// Audio sample data
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "Video"),
            MediaKind::Audio => write!(f, "Audio"),
        }
    }
}

/// PCM sample encoding, named the way FFmpeg names them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    Flt,
    Dbl,
    U8p,
    S16p,
    S32p,
    Fltp,
    Dblp,
}

impl SampleFormat {
    const ALL: [SampleFormat; 10] = [
        SampleFormat::U8,
        SampleFormat::S16,
        SampleFormat::S32,
        SampleFormat::Flt,
        SampleFormat::Dbl,
        SampleFormat::U8p,
        SampleFormat::S16p,
        SampleFormat::S32p,
        SampleFormat::Fltp,
        SampleFormat::Dblp,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SampleFormat::U8 => "u8",
            SampleFormat::S16 => "s16",
            SampleFormat::S32 => "s32",
            SampleFormat::Flt => "flt",
            SampleFormat::Dbl => "dbl",
            SampleFormat::U8p => "u8p",
            SampleFormat::S16p => "s16p",
            SampleFormat::S32p => "s32p",
            SampleFormat::Fltp => "fltp",
            SampleFormat::Dblp => "dblp",
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::U8 | SampleFormat::U8p => 1,
            SampleFormat::S16 | SampleFormat::S16p => 2,
            SampleFormat::S32 | SampleFormat::S32p | SampleFormat::Flt | SampleFormat::Fltp => 4,
            SampleFormat::Dbl | SampleFormat::Dblp => 8,
        }
    }

    pub fn is_planar(&self) -> bool {
        matches!(
            self,
            SampleFormat::U8p
                | SampleFormat::S16p
                | SampleFormat::S32p
                | SampleFormat::Fltp
                | SampleFormat::Dblp
        )
    }
}

impl std::fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SampleFormat {
    type Err = ParseMediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|fmt| fmt.name() == s)
            .ok_or_else(|| ParseMediaError::new("sample format", s))
    }
}

/// Speaker arrangement of an audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelLayout {
    Mono,
    Stereo,
    TwoPointOne,
    Surround,
    Quad,
    FivePointZero,
    FivePointOne,
    SevenPointOne,
}

impl ChannelLayout {
    const ALL: [ChannelLayout; 8] = [
        ChannelLayout::Mono,
        ChannelLayout::Stereo,
        ChannelLayout::TwoPointOne,
        ChannelLayout::Surround,
        ChannelLayout::Quad,
        ChannelLayout::FivePointZero,
        ChannelLayout::FivePointOne,
        ChannelLayout::SevenPointOne,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ChannelLayout::Mono => "mono",
            ChannelLayout::Stereo => "stereo",
            ChannelLayout::TwoPointOne => "2.1",
            ChannelLayout::Surround => "3.0",
            ChannelLayout::Quad => "quad",
            ChannelLayout::FivePointZero => "5.0",
            ChannelLayout::FivePointOne => "5.1",
            ChannelLayout::SevenPointOne => "7.1",
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
            ChannelLayout::TwoPointOne | ChannelLayout::Surround => 3,
            ChannelLayout::Quad => 4,
            ChannelLayout::FivePointZero => 5,
            ChannelLayout::FivePointOne => 6,
            ChannelLayout::SevenPointOne => 8,
        }
    }
}

impl std::fmt::Display for ChannelLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChannelLayout {
    type Err = ParseMediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|layout| layout.name() == s)
            .ok_or_else(|| ParseMediaError::new("channel layout", s))
    }
}

/// Static format description of one audio track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: u32,
    pub time_base: Timebase,
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
    pub channel_layout: ChannelLayout,
    /// Number of samples per output frame (used when rebatching)
    pub samples_per_frame: u32,
}

impl MediaTrack {
    pub fn audio(
        id: u32,
        sample_rate: u32,
        sample_format: SampleFormat,
        channel_layout: ChannelLayout,
        samples_per_frame: u32,
    ) -> Self {
        Self {
            id,
            time_base: Timebase::from_sample_rate(sample_rate),
            sample_rate,
            sample_format,
            channel_layout,
            samples_per_frame,
        }
    }

    pub fn with_time_base(mut self, time_base: Timebase) -> Self {
        self.time_base = time_base;
        self
    }

    /// Name of the first missing field, if any.
    ///
    /// Timebase validity is left to the timebase scale check.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.sample_rate == 0 {
            Some("sample_rate")
        } else {
            None
        }
    }
}

/// Decoded media frame
///
/// Audio samples live in a single buffer. Planar formats store each channel
/// plane back to back, interleaved formats store samples channel by channel.
#[derive(Clone)]
pub struct MediaFrame {
    /// Kind of media (video or audio)
    pub kind: MediaKind,

    /// Raw sample data
    pub data: Bytes,

    /// Presentation timestamp in `time_base` units
    pub pts: i64,

    pub time_base: Timebase,

    pub sample_rate: u32,

    pub sample_format: SampleFormat,

    pub channel_layout: ChannelLayout,

    /// Samples per channel
    pub nb_samples: usize,
}

impl MediaFrame {
    /// Create a new audio frame
    pub fn audio(
        data: Bytes,
        pts: i64,
        time_base: Timebase,
        sample_rate: u32,
        sample_format: SampleFormat,
        channel_layout: ChannelLayout,
        nb_samples: usize,
    ) -> Self {
        Self {
            kind: MediaKind::Audio,
            data,
            pts,
            time_base,
            sample_rate,
            sample_format,
            channel_layout,
            nb_samples,
        }
    }

    /// Buffer size an audio frame with these parameters must have
    pub fn expected_size(&self) -> usize {
        self.nb_samples * self.channel_layout.channels() * self.sample_format.bytes_per_sample()
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp::new(self.pts, self.time_base)
    }

    /// Get the size of the frame data in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for MediaFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaFrame")
            .field("kind", &self.kind)
            .field("pts", &self.pts)
            .field("time_base", &self.time_base)
            .field("sample_rate", &self.sample_rate)
            .field("sample_format", &self.sample_format)
            .field("channel_layout", &self.channel_layout)
            .field("nb_samples", &self.nb_samples)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timebase_parse_and_display() {
        let tb: Timebase = "1/48000".parse().unwrap();
        assert_eq!(tb, Timebase::new(1, 48000));
        assert_eq!(tb.to_string(), "1/48000");
        assert!("48000".parse::<Timebase>().is_err());
        assert!("a/b".parse::<Timebase>().is_err());
    }

    #[test]
    fn test_timebase_ratio() {
        let input = Timebase::new(1, 44100);
        let output = Timebase::new(1, 48000);
        let ratio = input.ratio(output);
        assert!((ratio - 48000.0 / 44100.0).abs() < 1e-12);

        assert_eq!(Timebase::new(0, 1).ratio(output), 0.0);
        assert!(!input.ratio(Timebase::new(0, 1)).is_finite());
    }

    #[test]
    fn test_timestamp_rescale() {
        let ts = Timestamp::new(44100, Timebase::new(1, 44100));
        assert_eq!(ts.rescale(Timebase::new(1, 48000)).value, 48000);
        assert_eq!(ts.rescale(Timebase::new(1, 1000)).value, 1000);

        // 1 tick at 1/3 -> 1/2 is 0.666.. ticks, rounds to 1
        let ts = Timestamp::new(1, Timebase::new(1, 3));
        assert_eq!(ts.rescale(Timebase::new(1, 2)).value, 1);

        let ts = Timestamp::new(-1, Timebase::new(1, 3));
        assert_eq!(ts.rescale(Timebase::new(1, 2)).value, -1);
    }

    #[test]
    fn test_sample_format_names() {
        for fmt in SampleFormat::ALL {
            assert_eq!(fmt.name().parse::<SampleFormat>().unwrap(), fmt);
        }
        assert!(SampleFormat::Fltp.is_planar());
        assert!(!SampleFormat::S16.is_planar());
        assert_eq!(SampleFormat::Dblp.bytes_per_sample(), 8);
        assert!("s24".parse::<SampleFormat>().is_err());
    }

    #[test]
    fn test_channel_layout_names() {
        for layout in ChannelLayout::ALL {
            assert_eq!(layout.name().parse::<ChannelLayout>().unwrap(), layout);
        }
        assert_eq!(ChannelLayout::FivePointOne.channels(), 6);
    }

    #[test]
    fn test_track_missing_field() {
        let track = MediaTrack::audio(1, 48000, SampleFormat::Fltp, ChannelLayout::Stereo, 1024);
        assert_eq!(track.missing_field(), None);
        assert_eq!(
            track.clone().with_time_base(Timebase::new(0, 1)).missing_field(),
            None
        );
        let mut track = track;
        track.sample_rate = 0;
        assert_eq!(track.missing_field(), Some("sample_rate"));
    }
}
