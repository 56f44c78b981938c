use anyhow::{Context, Result};
use clap::{Arg, Command, value_parser};
use log::{info, warn};
use resampler_stage::config::{StageConfig, app_name, app_version};
use resampler_stage::filter::native::dsp;
use resampler_stage::filter::{FilterEngine, NativeEngine, Resampler};
use resampler_stage::pipeline::health::QueueProbe;
use resampler_stage::pipeline::{
    ChannelLayout, HealthMonitor, MediaFrame, MediaTrack, PipelineStage, SampleFormat,
};
use std::f32::consts::TAU;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

struct Options {
    input: MediaTrack,
    output: MediaTrack,
    input_frame: usize,
    duration_ms: u64,
    tone: f32,
    config: StageConfig,
}

fn cli() -> Command {
    Command::new(app_name())
        .version(app_version())
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("input-rate")
                .long("input-rate")
                .value_name("HZ")
                .help("Sample rate of the generated input")
                .value_parser(value_parser!(u32).range(1..))
                .default_value("44100"),
        )
        .arg(
            Arg::new("output-rate")
                .long("output-rate")
                .value_name("HZ")
                .value_parser(value_parser!(u32).range(1..))
                .default_value("48000"),
        )
        .arg(
            Arg::new("input-format")
                .long("input-format")
                .value_name("FMT")
                .value_parser(|s: &str| s.parse::<SampleFormat>())
                .default_value("s16"),
        )
        .arg(
            Arg::new("output-format")
                .long("output-format")
                .value_name("FMT")
                .value_parser(|s: &str| s.parse::<SampleFormat>())
                .default_value("fltp"),
        )
        .arg(
            Arg::new("input-layout")
                .long("input-layout")
                .value_name("LAYOUT")
                .value_parser(|s: &str| s.parse::<ChannelLayout>())
                .default_value("stereo"),
        )
        .arg(
            Arg::new("output-layout")
                .long("output-layout")
                .value_name("LAYOUT")
                .value_parser(|s: &str| s.parse::<ChannelLayout>())
                .default_value("stereo"),
        )
        .arg(
            Arg::new("input-frame")
                .long("input-frame")
                .value_name("SAMPLES")
                .help("Samples per generated input frame")
                .value_parser(value_parser!(usize))
                .default_value("441"),
        )
        .arg(
            Arg::new("samples-per-frame")
                .short('n')
                .long("samples-per-frame")
                .value_name("SAMPLES")
                .help("Samples per output frame")
                .value_parser(value_parser!(u32).range(1..))
                .default_value("1024"),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_name("MS")
                .help("Length of the generated tone in milliseconds")
                .value_parser(value_parser!(u64))
                .default_value("1000"),
        )
        .arg(
            Arg::new("tone")
                .long("tone")
                .value_name("HZ")
                .value_parser(value_parser!(f32))
                .default_value("440"),
        )
        .arg(
            Arg::new("engine")
                .short('e')
                .long("engine")
                .value_name("ENGINE")
                .help("Filter engine running the graph")
                .value_parser(["native", "ffmpeg"])
                .default_value("native"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML file with stage settings"),
        )
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let matches = cli().get_matches();

    let config = match matches.get_one::<String>("config") {
        Some(path) => {
            StageConfig::load(path).with_context(|| format!("Failed to load config from {}", path))?
        }
        None => StageConfig::default(),
    };

    let input_rate = *matches.get_one::<u32>("input-rate").context("missing input rate")?;
    let output_rate = *matches.get_one::<u32>("output-rate").context("missing output rate")?;
    let input_format = *matches
        .get_one::<SampleFormat>("input-format")
        .context("missing input format")?;
    let output_format = *matches
        .get_one::<SampleFormat>("output-format")
        .context("missing output format")?;
    let input_layout = *matches
        .get_one::<ChannelLayout>("input-layout")
        .context("missing input layout")?;
    let output_layout = *matches
        .get_one::<ChannelLayout>("output-layout")
        .context("missing output layout")?;
    let samples_per_frame = *matches
        .get_one::<u32>("samples-per-frame")
        .context("missing samples per frame")?;

    let options = Options {
        input: MediaTrack::audio(1, input_rate, input_format, input_layout, 0),
        output: MediaTrack::audio(2, output_rate, output_format, output_layout, samples_per_frame),
        input_frame: (*matches.get_one::<usize>("input-frame").context("missing input frame")?).max(1),
        duration_ms: *matches.get_one::<u64>("duration").context("missing duration")?,
        tone: *matches.get_one::<f32>("tone").context("missing tone")?,
        config,
    };

    match matches.get_one::<String>("engine").map(String::as_str) {
        #[cfg(feature = "ffmpeg")]
        Some("ffmpeg") => run(resampler_stage::filter::FfmpegEngine::new(), options),
        #[cfg(not(feature = "ffmpeg"))]
        Some("ffmpeg") => anyhow::bail!("{} was built without the ffmpeg feature", app_name()),
        _ => run(NativeEngine::new(), options),
    }
}

fn run<E: FilterEngine>(engine: E, options: Options) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .context("Failed to start the health monitor runtime")?;

    let outputs = Arc::new(AtomicUsize::new(0));
    let output_samples = Arc::new(AtomicUsize::new(0));
    let (frames, samples) = (Arc::clone(&outputs), Arc::clone(&output_samples));

    let mut resampler = Resampler::with_config(engine, options.config.clone()).with_complete_handler(
        move |frame: MediaFrame| {
            frames.fetch_add(1, Ordering::Relaxed);
            samples.fetch_add(frame.nb_samples, Ordering::Relaxed);
        },
    );

    let health = resampler.health();
    let queue: Arc<dyn QueueProbe> = resampler.queue();
    let (alert_tx, mut alert_rx) = mpsc::channel(16);
    let monitor = HealthMonitor::new(Arc::clone(&health), alert_tx)
        .with_queue(queue)
        .with_check_interval(Duration::from_millis(250));
    runtime.spawn(async move { monitor.run().await });
    runtime.spawn(async move {
        while let Some(alert) = alert_rx.recv().await {
            warn!("Health alert: {}", alert);
        }
    });

    let stage: &mut dyn PipelineStage = &mut resampler;
    stage.configure(&options.input, &options.output)?;
    stage.start()?;
    info!("{} started: {} -> {}", stage.name(), options.input.sample_rate, options.output.sample_rate);

    let total = (options.input.sample_rate as u64 * options.duration_ms / 1000) as usize;
    let channels = options.input.channel_layout.channels();
    let step = TAU * options.tone / options.input.sample_rate as f32;

    let mut position = 0usize;
    while position < total {
        let nb_samples = options.input_frame.min(total - position);
        let tone: Vec<f32> = (position..position + nb_samples)
            .map(|i| 0.5 * (step * i as f32).sin())
            .collect();
        let planes = vec![tone; channels];

        stage.send_buffer(MediaFrame::audio(
            dsp::encode(&planes, options.input.sample_format),
            position as i64,
            options.input.time_base,
            options.input.sample_rate,
            options.input.sample_format,
            options.input.channel_layout,
            nb_samples,
        ))?;
        position += nb_samples;
    }

    stage.stop();
    runtime.shutdown_background();

    println!("input:  {} samples in {} frames", total, total.div_ceil(options.input_frame));
    println!(
        "output: {} samples in {} frames of {}",
        output_samples.load(Ordering::Relaxed),
        outputs.load(Ordering::Relaxed),
        options.output.samples_per_frame
    );
    println!("{}", health.summary());
    Ok(())
}
