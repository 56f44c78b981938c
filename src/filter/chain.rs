//! Filter graph description
//!
//! The resampler describes its graph the way FFmpeg's filter syntax does:
//! a parameter string for the `abuffer` source and a comma separated chain
//! of filters between source and sink:
//!
//! ```text
//! [abuffer] -> [asettb] -> [aresample async] -> [aresample] -> [aformat] -> [asetnsamples] -> [abuffersink]
//! ```

use crate::error::ChainParseError;
use crate::pipeline::types::{ChannelLayout, MediaTrack, SampleFormat, Timebase};
use std::str::FromStr;

/// Parameters of the graph's source node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceParams {
    pub time_base: Timebase,
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
    pub channel_layout: ChannelLayout,
}

impl SourceParams {
    pub fn from_track(track: &MediaTrack) -> Self {
        Self {
            time_base: track.time_base,
            sample_rate: track.sample_rate,
            sample_format: track.sample_format,
            channel_layout: track.channel_layout,
        }
    }
}

impl std::fmt::Display for SourceParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "time_base={}:sample_rate={}:sample_fmt={}:channel_layout={}",
            self.time_base, self.sample_rate, self.sample_format, self.channel_layout
        )
    }
}

/// One filter of the output chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterNode {
    /// `asettb`: restamp frames into the given timebase
    SetTimebase(Timebase),

    /// `aresample=async=N`: stretch/squeeze to the timestamps, at most N
    /// samples per second of correction
    AsyncResample { compensation: u32 },

    /// `aresample=R`: convert to the given sample rate
    Resample { sample_rate: u32 },

    /// `aformat`: convert sample format and/or channel layout
    Format {
        sample_format: Option<SampleFormat>,
        channel_layout: Option<ChannelLayout>,
    },

    /// `asetnsamples=n=N`: rebatch into frames of exactly N samples
    SetSamples { samples: usize },
}

impl FilterNode {
    pub fn name(&self) -> &'static str {
        match self {
            FilterNode::SetTimebase(_) => "asettb",
            FilterNode::AsyncResample { .. } | FilterNode::Resample { .. } => "aresample",
            FilterNode::Format { .. } => "aformat",
            FilterNode::SetSamples { .. } => "asetnsamples",
        }
    }

    fn parse(filter: &str) -> Result<Self, ChainParseError> {
        let (name, args) = match filter.split_once('=') {
            Some((name, args)) => (name.trim(), args.trim()),
            None => (filter.trim(), ""),
        };

        match name {
            "asettb" => {
                let value = strip_key(args, "tb").or_else(|| strip_key(args, "expr"));
                value
                    .and_then(|tb| tb.parse::<Timebase>().ok())
                    .filter(|tb: &Timebase| tb.is_valid())
                    .map(FilterNode::SetTimebase)
                    .ok_or_else(|| invalid("asettb", args))
            }
            "aresample" => {
                if let Some(budget) = args.strip_prefix("async=") {
                    budget
                        .parse::<u32>()
                        .map(|compensation| FilterNode::AsyncResample { compensation })
                        .map_err(|_| invalid("aresample", args))
                } else {
                    strip_key(args, "osr")
                        .and_then(|rate| rate.parse::<u32>().ok())
                        .filter(|rate: &u32| *rate > 0)
                        .map(|sample_rate| FilterNode::Resample { sample_rate })
                        .ok_or_else(|| invalid("aresample", args))
                }
            }
            "aformat" => {
                let mut sample_format = None;
                let mut channel_layout = None;
                for option in args.split(':').filter(|o| !o.is_empty()) {
                    let (key, value) = option
                        .split_once('=')
                        .ok_or_else(|| invalid("aformat", args))?;
                    // Only a single candidate per option is supported
                    match key {
                        "sample_fmts" => {
                            sample_format =
                                Some(value.parse::<SampleFormat>().map_err(|_| invalid("aformat", args))?)
                        }
                        "channel_layouts" => {
                            channel_layout =
                                Some(value.parse::<ChannelLayout>().map_err(|_| invalid("aformat", args))?)
                        }
                        _ => return Err(invalid("aformat", args)),
                    }
                }
                if sample_format.is_none() && channel_layout.is_none() {
                    return Err(invalid("aformat", args));
                }
                Ok(FilterNode::Format {
                    sample_format,
                    channel_layout,
                })
            }
            "asetnsamples" => strip_key(args, "n")
                .or_else(|| strip_key(args, "nb_out_samples"))
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n: &usize| *n > 0)
                .map(|samples| FilterNode::SetSamples { samples })
                .ok_or_else(|| invalid("asetnsamples", args)),
            "" => Err(ChainParseError::Empty),
            other => Err(ChainParseError::UnknownFilter(other.to_string())),
        }
    }
}

/// Value of `key=value`, or the bare argument when no key is given
fn strip_key<'a>(args: &'a str, key: &str) -> Option<&'a str> {
    match args.split_once('=') {
        Some((k, v)) if k == key => Some(v),
        Some(_) => None,
        None if !args.is_empty() => Some(args),
        None => None,
    }
}

fn invalid(filter: &'static str, arg: &str) -> ChainParseError {
    ChainParseError::InvalidArgument {
        filter,
        arg: arg.to_string(),
    }
}

impl std::fmt::Display for FilterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterNode::SetTimebase(tb) => write!(f, "asettb={}", tb),
            FilterNode::AsyncResample { compensation } => write!(f, "aresample=async={}", compensation),
            FilterNode::Resample { sample_rate } => write!(f, "aresample={}", sample_rate),
            FilterNode::Format {
                sample_format,
                channel_layout,
            } => {
                f.write_str("aformat=")?;
                let mut options = Vec::with_capacity(2);
                if let Some(fmt) = sample_format {
                    options.push(format!("sample_fmts={}", fmt));
                }
                if let Some(layout) = channel_layout {
                    options.push(format!("channel_layouts={}", layout));
                }
                f.write_str(&options.join(":"))
            }
            FilterNode::SetSamples { samples } => write!(f, "asetnsamples=n={}", samples),
        }
    }
}

/// Ordered list of filters between the source and the sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterChain {
    nodes: Vec<FilterNode>,
}

impl FilterChain {
    pub fn new(nodes: Vec<FilterNode>) -> Self {
        Self { nodes }
    }

    /// Chain that turns any input into frames matching `output`
    pub fn for_output(output: &MediaTrack, async_compensation: u32) -> Self {
        Self::new(vec![
            FilterNode::SetTimebase(output.time_base),
            FilterNode::AsyncResample {
                compensation: async_compensation,
            },
            FilterNode::Resample {
                sample_rate: output.sample_rate,
            },
            FilterNode::Format {
                sample_format: Some(output.sample_format),
                channel_layout: Some(output.channel_layout),
            },
            FilterNode::SetSamples {
                samples: output.samples_per_frame as usize,
            },
        ])
    }

    pub fn nodes(&self) -> &[FilterNode] {
        &self.nodes
    }
}

impl std::fmt::Display for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", node)?;
        }
        Ok(())
    }
}

impl FromStr for FilterChain {
    type Err = ChainParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ChainParseError::Empty);
        }
        let nodes = s
            .split(',')
            .map(FilterNode::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { nodes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output_track() -> MediaTrack {
        MediaTrack::audio(2, 48000, SampleFormat::Fltp, ChannelLayout::Stereo, 1024)
    }

    #[test]
    fn test_source_params_string() {
        let input = MediaTrack::audio(1, 44100, SampleFormat::S16, ChannelLayout::Mono, 0);
        assert_eq!(
            SourceParams::from_track(&input).to_string(),
            "time_base=1/44100:sample_rate=44100:sample_fmt=s16:channel_layout=mono"
        );
    }

    #[test]
    fn test_output_chain_string() {
        let chain = FilterChain::for_output(&output_track(), 1000);
        assert_eq!(
            chain.to_string(),
            "asettb=1/48000,aresample=async=1000,aresample=48000,\
             aformat=sample_fmts=fltp:channel_layouts=stereo,asetnsamples=n=1024"
        );
    }

    #[test]
    fn test_parse_output_chain() {
        let chain = FilterChain::for_output(&output_track(), 1000);
        let parsed: FilterChain = chain.to_string().parse().unwrap();
        assert_eq!(parsed, chain);
    }

    #[test]
    fn test_parse_alternate_spellings() {
        let chain: FilterChain = "asettb=tb=1/1000,aresample=osr=16000,aformat=channel_layouts=mono,asetnsamples=256"
            .parse()
            .unwrap();
        assert_eq!(
            chain.nodes(),
            &[
                FilterNode::SetTimebase(Timebase::new(1, 1000)),
                FilterNode::Resample { sample_rate: 16000 },
                FilterNode::Format {
                    sample_format: None,
                    channel_layout: Some(ChannelLayout::Mono),
                },
                FilterNode::SetSamples { samples: 256 },
            ]
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<FilterChain>(), Err(ChainParseError::Empty));
        assert_eq!(
            "volume=0.5".parse::<FilterChain>(),
            Err(ChainParseError::UnknownFilter("volume".to_string()))
        );
        assert!(matches!(
            "aresample=fast".parse::<FilterChain>(),
            Err(ChainParseError::InvalidArgument { filter: "aresample", .. })
        ));
        assert!("asettb=1/0".parse::<FilterChain>().is_err());
        assert!("asetnsamples=n=0".parse::<FilterChain>().is_err());
        assert!("aformat=sample_fmts=s24".parse::<FilterChain>().is_err());
        assert!("aresample=48000,".parse::<FilterChain>().is_err());
    }
}
