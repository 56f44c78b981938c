//! Audio resampling stage
//!
//! Frames arrive through [`Resampler::send_buffer`] (or a [`FrameSender`])
//! into an unbounded queue. A dedicated worker thread drains the queue,
//! pushes every frame into the filter engine and hands each frame the
//! engine's sink produces to the completion callback, in order.

use super::chain::{FilterChain, SourceParams};
use super::{FilterEngine, Pull};
use crate::config::StageConfig;
use crate::error::{ConfigureError, EngineError, StageError};
use crate::pipeline::health::StageHealth;
use crate::pipeline::queue::FrameQueue;
use crate::pipeline::stage::{CompleteHandler, PipelineStage};
use crate::pipeline::{MediaFrame, MediaTrack, StageState};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

/// State owned by the worker thread while the stage runs
struct WorkerParts<E> {
    engine: E,
    handler: Option<CompleteHandler>,
}

/// Cloneable producer handle for a stage's input queue
#[derive(Clone)]
pub struct FrameSender {
    queue: Arc<FrameQueue<MediaFrame>>,
    health: Arc<StageHealth>,
}

impl FrameSender {
    /// Queue a frame. Never blocks.
    pub fn send(&self, frame: MediaFrame) {
        self.health.record_received();
        self.queue.enqueue(frame);
    }
}

/// Resampling stage driving a [`FilterEngine`] from its own worker thread
pub struct Resampler<E: FilterEngine> {
    config: StageConfig,
    state: StageState,

    input_track: Option<MediaTrack>,
    output_track: Option<MediaTrack>,
    /// input timebase / output timebase
    scale: f64,
    source_params: Option<String>,
    filter_chain: Option<String>,

    queue: Arc<FrameQueue<MediaFrame>>,
    kill_flag: Arc<AtomicBool>,
    health: Arc<StageHealth>,

    // Owned by the worker thread between `start` and `stop`
    engine: Option<E>,
    complete_handler: Option<CompleteHandler>,
    worker: Option<JoinHandle<Option<WorkerParts<E>>>>,
}

impl<E: FilterEngine> Resampler<E> {
    pub fn new(engine: E) -> Self {
        Self::with_config(engine, StageConfig::default())
    }

    pub fn with_config(engine: E, config: StageConfig) -> Self {
        let queue = FrameQueue::new(config.queue_alias.clone(), config.queue_threshold);

        Self {
            config,
            state: StageState::Unconfigured,
            input_track: None,
            output_track: None,
            scale: 0.0,
            source_params: None,
            filter_chain: None,
            queue: Arc::new(queue),
            kill_flag: Arc::new(AtomicBool::new(true)),
            health: Arc::new(StageHealth::new()),
            engine: Some(engine),
            complete_handler: None,
            worker: None,
        }
    }

    /// Set the callback receiving every output frame, on the worker thread.
    ///
    /// Fails while the worker is running, since the worker owns the callback.
    pub fn set_complete_handler<F>(&mut self, handler: F) -> Result<(), StageError>
    where
        F: FnMut(MediaFrame) + Send + 'static,
    {
        if self.worker.is_some() {
            return Err(StageError::AlreadyRunning);
        }
        self.complete_handler = Some(Box::new(handler));
        Ok(())
    }

    pub fn with_complete_handler<F>(mut self, handler: F) -> Self
    where
        F: FnMut(MediaFrame) + Send + 'static,
    {
        self.complete_handler = Some(Box::new(handler));
        self
    }

    fn set_state(&mut self, state: StageState) {
        if !self.state.can_transition_to(&state) {
            warn!("Resampler: unexpected transition {} -> {}", self.state, state);
        }
        debug!("Resampler: {} -> {}", self.state, state);
        self.state = state;
    }

    /// Build the filter graph converting `input_track` frames into
    /// `output_track` frames.
    ///
    /// On failure the engine is released and the stage is left unconfigured.
    pub fn configure(
        &mut self,
        input_track: &MediaTrack,
        output_track: &MediaTrack,
    ) -> Result<(), ConfigureError> {
        if !self.state.can_configure() {
            return Err(ConfigureError::InvalidState(self.state));
        }

        // Frames sent after `stop` belong to the previous run
        if self.state == StageState::Stopped {
            let stale = self.queue.len();
            if stale > 0 {
                warn!("Resampler: discarding {} frame(s) queued after stop", stale);
                self.queue.clear();
            }
        }

        let result = self.build_graph(input_track, output_track);
        match &result {
            Ok(()) => {
                self.input_track = Some(input_track.clone());
                self.output_track = Some(output_track.clone());
                self.set_state(StageState::Configured);

                info!(
                    "Resampler is enabled for track #{} using parameters. input: {} / outputs: {}",
                    input_track.id,
                    self.source_params.as_deref().unwrap_or_default(),
                    self.filter_chain.as_deref().unwrap_or_default()
                );
            }
            Err(e) => {
                error!("Resampler for track #{}: {}", input_track.id, e);

                if let Some(engine) = self.engine.as_mut() {
                    engine.release();
                }
                self.input_track = None;
                self.output_track = None;
                self.source_params = None;
                self.filter_chain = None;
                self.scale = 0.0;
                self.set_state(StageState::Unconfigured);
            }
        }
        result
    }

    fn build_graph(
        &mut self,
        input_track: &MediaTrack,
        output_track: &MediaTrack,
    ) -> Result<(), ConfigureError> {
        for track in [input_track, output_track] {
            if let Some(field) = track.missing_field() {
                return Err(ConfigureError::IncompleteTrack {
                    track: track.id,
                    field,
                });
            }
        }
        if output_track.samples_per_frame == 0 {
            return Err(ConfigureError::IncompleteTrack {
                track: output_track.id,
                field: "samples_per_frame",
            });
        }

        let scale = input_track.time_base.ratio(output_track.time_base);
        if !scale.is_finite() || scale <= 0.0 {
            return Err(ConfigureError::InvalidTimebase {
                input: input_track.time_base.to_string(),
                output: output_track.time_base.to_string(),
            });
        }

        let engine = self
            .engine
            .as_mut()
            .ok_or(ConfigureError::EngineUnavailable)?;

        let source = SourceParams::from_track(input_track);
        let chain = FilterChain::for_output(output_track, self.config.async_compensation).to_string();

        // Drop any graph left over from a previous configuration
        engine.release();
        engine.configure(&source, &chain).map_err(|e| match e {
            EngineError::ChainParse(source) => ConfigureError::ChainParse {
                chain: chain.clone(),
                source,
            },
            other => ConfigureError::Engine(other),
        })?;

        self.scale = scale;
        self.source_params = Some(source.to_string());
        self.filter_chain = Some(chain);
        Ok(())
    }

    /// Spawn the worker thread
    pub fn start(&mut self) -> Result<(), StageError> {
        match self.state {
            StageState::Configured => {}
            StageState::Running => return Err(StageError::AlreadyRunning),
            other => return Err(StageError::NotConfigured(other)),
        }
        // Configs built in code skip `StageConfig::load`, and a bad thread
        // name makes `thread::Builder::spawn` panic
        self.config.validate().map_err(StageError::Config)?;

        let Some(engine) = self.engine.take() else {
            return Err(StageError::NotConfigured(self.state));
        };
        let parts = WorkerParts {
            engine,
            handler: self.complete_handler.take(),
        };

        self.kill_flag.store(false, Ordering::Release);
        self.queue.restart();

        // The worker receives its parts only once spawning succeeded, so a
        // failed spawn leaves the engine with the stage.
        let (parts_tx, parts_rx) = mpsc::sync_channel::<WorkerParts<E>>(1);
        let queue = Arc::clone(&self.queue);
        let kill_flag = Arc::clone(&self.kill_flag);
        let health = Arc::clone(&self.health);

        let spawned = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || run_worker(parts_rx, &queue, &kill_flag, &health));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.kill_flag.store(true, Ordering::Release);
                self.engine = Some(parts.engine);
                self.complete_handler = parts.handler;
                error!("Failed to start transcode resample filter thread: {}", e);
                return Err(StageError::Spawn(e));
            }
        };

        if let Err(mpsc::SendError(parts)) = parts_tx.send(parts) {
            // Only possible if the worker died before receiving anything
            self.kill_flag.store(true, Ordering::Release);
            self.engine = Some(parts.engine);
            self.complete_handler = parts.handler;
            let _ = handle.join();
            return Err(StageError::Spawn(std::io::Error::other(
                "worker exited before start",
            )));
        }

        self.worker = Some(handle);
        self.set_state(StageState::Running);
        Ok(())
    }

    /// Signal shutdown and wait for the worker to exit.
    ///
    /// Frames already queued are still processed before the worker exits.
    /// Safe to call repeatedly, before `start`, or after the worker died.
    pub fn stop(&mut self) {
        self.kill_flag.store(true, Ordering::Release);
        self.queue.stop();

        let Some(handle) = self.worker.take() else {
            return;
        };

        self.set_state(StageState::Stopping);
        match handle.join() {
            Ok(Some(parts)) => {
                self.engine = Some(parts.engine);
                self.complete_handler = parts.handler;
                debug!("resampler filter thread has ended");
            }
            Ok(None) => {
                error!("resampler filter thread ended without its filter engine");
            }
            Err(_) => {
                error!("resampler filter thread panicked, filter engine is lost");
            }
        }
        self.set_state(StageState::Stopped);
    }

    /// Queue a frame for resampling. Never blocks.
    ///
    /// Frames sent after `stop` are accepted but never consumed; the next
    /// `configure` discards them.
    pub fn send_buffer(&self, frame: MediaFrame) -> Result<(), StageError> {
        self.health.record_received();
        self.queue.enqueue(frame);
        Ok(())
    }

    /// Producer handle usable from other threads
    pub fn sender(&self) -> FrameSender {
        FrameSender {
            queue: Arc::clone(&self.queue),
            health: Arc::clone(&self.health),
        }
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    /// Whether the worker thread is still processing frames.
    ///
    /// Turns false after a fatal worker error even though the stage is still
    /// `Running`.
    pub fn is_worker_alive(&self) -> bool {
        self.worker.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Timebase scale factor (input timebase / output timebase)
    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn input_track(&self) -> Option<&MediaTrack> {
        self.input_track.as_ref()
    }

    pub fn output_track(&self) -> Option<&MediaTrack> {
        self.output_track.as_ref()
    }

    /// Resolved source node parameters
    pub fn source_params(&self) -> Option<&str> {
        self.source_params.as_deref()
    }

    /// Resolved output filter chain
    pub fn filter_chain(&self) -> Option<&str> {
        self.filter_chain.as_deref()
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn health(&self) -> Arc<StageHealth> {
        Arc::clone(&self.health)
    }

    pub fn queue(&self) -> Arc<FrameQueue<MediaFrame>> {
        Arc::clone(&self.queue)
    }
}

impl<E: FilterEngine> PipelineStage for Resampler<E> {
    fn name(&self) -> &'static str {
        "Resampler"
    }

    fn configure(&mut self, input: &MediaTrack, output: &MediaTrack) -> Result<(), ConfigureError> {
        Resampler::configure(self, input, output)
    }

    fn start(&mut self) -> Result<(), StageError> {
        Resampler::start(self)
    }

    fn stop(&mut self) {
        Resampler::stop(self)
    }

    fn send_buffer(&self, frame: MediaFrame) -> Result<(), StageError> {
        Resampler::send_buffer(self, frame)
    }

    fn state(&self) -> StageState {
        self.state
    }
}

impl<E: FilterEngine> Drop for Resampler<E> {
    fn drop(&mut self) {
        self.stop();
        self.queue.clear();
        if let Some(engine) = self.engine.as_mut() {
            engine.release();
        }
    }
}

fn run_worker<E: FilterEngine>(
    parts_rx: mpsc::Receiver<WorkerParts<E>>,
    queue: &FrameQueue<MediaFrame>,
    kill_flag: &AtomicBool,
    health: &StageHealth,
) -> Option<WorkerParts<E>> {
    let mut parts = parts_rx.recv().ok()?;

    debug!("Start resampler filter thread.");
    parts.run(queue, kill_flag, health);
    debug!("Resampler filter thread is exiting");

    Some(parts)
}

impl<E: FilterEngine> WorkerParts<E> {
    fn run(&mut self, queue: &FrameQueue<MediaFrame>, kill_flag: &AtomicBool, health: &StageHealth) {
        loop {
            let Some(media_frame) = queue.dequeue() else {
                if !kill_flag.load(Ordering::Acquire) {
                    warn!("Resampler input queue stopped without a shutdown request");
                }
                break;
            };

            let pts = media_frame.pts;
            let frame = match self.engine.import(media_frame) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Could not allocate the frame data: pts: {}: {}", pts, e);
                    health.record_fatal();
                    break;
                }
            };

            if let Err(e) = self.engine.push(&frame) {
                error!(
                    "An error occurred while feeding the audio filtergraph: pts: {}, queued: {}: {}",
                    pts,
                    queue.len(),
                    e
                );
                health.record_push_failure();
                continue;
            }
            health.record_pushed();
            drop(frame);

            self.drain(health);
        }
    }

    /// Pull every frame the sink has ready
    fn drain(&mut self, health: &StageHealth) {
        loop {
            match self.engine.pull() {
                Pull::NotReady => break,
                Pull::EndOfStream => {
                    warn!("Filter graph reached end of stream");
                    health.record_end_of_stream();
                    break;
                }
                Pull::Error(e) => {
                    error!("Error receiving a frame from the filter graph: {}", e);
                    health.record_pull_error();
                    break;
                }
                Pull::Ready(frame) => match self.engine.export(frame) {
                    Ok(output_frame) => {
                        health.record_emitted();
                        if let Some(handler) = self.handler.as_mut() {
                            handler(output_frame);
                        }
                    }
                    Err(e) => {
                        error!("Could not convert the output frame: {}", e);
                        health.record_conversion_failure();
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::NativeEngine;
    use crate::pipeline::types::{ChannelLayout, SampleFormat, Timebase};
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Default, Clone)]
    struct Behavior {
        outputs_per_push: usize,
        fail_configure: Option<EngineError>,
        fail_import: Option<i64>,
        fail_push: Vec<i64>,
        fail_export: Vec<i64>,
        end_of_stream_on: Vec<i64>,
        pull_error_on: Vec<i64>,
    }

    enum Terminal {
        EndOfStream,
        Error,
    }

    /// Engine that emits `outputs_per_push` copies of every pushed frame,
    /// stamped `pts * 10 + n`
    struct MockEngine {
        behavior: Behavior,
        pending: VecDeque<MediaFrame>,
        terminal: Option<Terminal>,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl MockEngine {
        fn new(behavior: Behavior) -> (Self, Arc<Mutex<Vec<String>>>) {
            let events = Arc::new(Mutex::new(Vec::new()));
            let engine = Self {
                behavior,
                pending: VecDeque::new(),
                terminal: None,
                events: Arc::clone(&events),
            };
            (engine, events)
        }

        fn log(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl FilterEngine for MockEngine {
        type Frame = MediaFrame;

        fn configure(&mut self, source: &SourceParams, chain: &str) -> Result<(), EngineError> {
            self.log(format!("configure {} | {}", source, chain));
            match self.behavior.fail_configure.clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn import(&mut self, frame: MediaFrame) -> Result<MediaFrame, EngineError> {
            if self.behavior.fail_import == Some(frame.pts) {
                return Err(EngineError::FormatMismatch("mock".to_string()));
            }
            Ok(frame)
        }

        fn push(&mut self, frame: &MediaFrame) -> Result<(), EngineError> {
            if self.behavior.fail_push.contains(&frame.pts) {
                return Err(EngineError::Backend("rejected".to_string()));
            }
            for n in 0..self.behavior.outputs_per_push {
                let mut output = frame.clone();
                output.pts = frame.pts * 10 + n as i64;
                self.pending.push_back(output);
            }
            if self.behavior.end_of_stream_on.contains(&frame.pts) {
                self.terminal = Some(Terminal::EndOfStream);
            }
            if self.behavior.pull_error_on.contains(&frame.pts) {
                self.terminal = Some(Terminal::Error);
            }
            Ok(())
        }

        fn pull(&mut self) -> Pull<MediaFrame> {
            match self.terminal.take() {
                Some(Terminal::EndOfStream) => return Pull::EndOfStream,
                Some(Terminal::Error) => return Pull::Error(EngineError::Backend("pull".to_string())),
                None => {}
            }
            match self.pending.pop_front() {
                Some(frame) => Pull::Ready(frame),
                None => Pull::NotReady,
            }
        }

        fn export(&mut self, frame: MediaFrame) -> Result<MediaFrame, EngineError> {
            if self.behavior.fail_export.contains(&frame.pts) {
                return Err(EngineError::Backend("export".to_string()));
            }
            Ok(frame)
        }

        fn release(&mut self) {
            self.pending.clear();
            self.log("release".to_string());
        }
    }

    fn input_track() -> MediaTrack {
        MediaTrack::audio(1, 44100, SampleFormat::S16, ChannelLayout::Mono, 0)
    }

    fn output_track() -> MediaTrack {
        MediaTrack::audio(2, 48000, SampleFormat::Fltp, ChannelLayout::Stereo, 1024)
    }

    fn frame(pts: i64) -> MediaFrame {
        MediaFrame::audio(
            Bytes::from(vec![0u8; 2]),
            pts,
            Timebase::new(1, 44100),
            44100,
            SampleFormat::S16,
            ChannelLayout::Mono,
            1,
        )
    }

    /// Configured stage whose callback records output pts values
    fn stage(behavior: Behavior) -> (Resampler<MockEngine>, Arc<Mutex<Vec<i64>>>, Arc<Mutex<Vec<String>>>) {
        let (engine, events) = MockEngine::new(behavior);
        let outputs = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outputs);
        let mut stage = Resampler::new(engine)
            .with_complete_handler(move |frame: MediaFrame| sink.lock().unwrap().push(frame.pts));
        stage.configure(&input_track(), &output_track()).unwrap();
        (stage, outputs, events)
    }

    fn one_output() -> Behavior {
        Behavior {
            outputs_per_push: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_configure_resolves_parameters() {
        let (stage, _, events) = stage(one_output());

        assert_eq!(stage.state(), StageState::Configured);
        assert!((stage.scale() - 48000.0 / 44100.0).abs() < 1e-12);
        assert_eq!(
            stage.source_params(),
            Some("time_base=1/44100:sample_rate=44100:sample_fmt=s16:channel_layout=mono")
        );
        assert_eq!(
            stage.filter_chain(),
            Some(
                "asettb=1/48000,aresample=async=1000,aresample=48000,\
                 aformat=sample_fmts=fltp:channel_layouts=stereo,asetnsamples=n=1024"
            )
        );
        let events = events.lock().unwrap();
        assert_eq!(events[0], "release");
        assert!(events[1].starts_with("configure time_base=1/44100"));
    }

    #[test]
    fn test_fifo_order() {
        let (mut stage, outputs, _) = stage(one_output());
        stage.start().unwrap();

        for pts in 0..100 {
            stage.send_buffer(frame(pts)).unwrap();
        }
        stage.stop();

        let expected: Vec<i64> = (0..100).map(|pts| pts * 10).collect();
        assert_eq!(*outputs.lock().unwrap(), expected);
        assert_eq!(stage.health().frames_emitted(), 100);
        assert_eq!(stage.state(), StageState::Stopped);
    }

    #[test]
    fn test_drain_exhaustiveness() {
        let (mut stage, outputs, _) = stage(Behavior {
            outputs_per_push: 3,
            ..Default::default()
        });
        stage.start().unwrap();
        stage.send_buffer(frame(1)).unwrap();
        stage.stop();

        assert_eq!(*outputs.lock().unwrap(), vec![10, 11, 12]);
    }

    #[test]
    fn test_stop_before_start() {
        let (engine, _) = MockEngine::new(one_output());
        let mut stage = Resampler::new(engine);
        stage.stop();
        assert_eq!(stage.state(), StageState::Unconfigured);

        stage.configure(&input_track(), &output_track()).unwrap();
        stage.stop();
        stage.stop();
        assert_eq!(stage.state(), StageState::Configured);
        assert!(!stage.is_worker_alive());

        // Still startable afterwards
        stage.start().unwrap();
        stage.stop();
        assert_eq!(stage.state(), StageState::Stopped);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut stage, outputs, _) = stage(one_output());
        stage.start().unwrap();
        stage.send_buffer(frame(0)).unwrap();

        stage.stop();
        let first = (stage.state(), outputs.lock().unwrap().clone());
        stage.stop();
        let second = (stage.state(), outputs.lock().unwrap().clone());

        assert_eq!(first, second);
        assert_eq!(second.0, StageState::Stopped);
    }

    #[test]
    fn test_zero_input_timebase_is_rejected() {
        let (engine, events) = MockEngine::new(one_output());
        let mut stage = Resampler::new(engine);
        let input = input_track().with_time_base(Timebase::new(0, 1));

        let result = stage.configure(&input, &output_track());
        assert!(matches!(result, Err(ConfigureError::InvalidTimebase { .. })));
        assert_eq!(stage.state(), StageState::Unconfigured);
        assert_eq!(stage.scale(), 0.0);
        assert!(!events.lock().unwrap().iter().any(|e| e.starts_with("configure")));
    }

    #[test]
    fn test_incomplete_tracks_are_rejected() {
        let (engine, _) = MockEngine::new(one_output());
        let mut stage = Resampler::new(engine);

        let mut output = output_track();
        output.samples_per_frame = 0;
        assert!(matches!(
            stage.configure(&input_track(), &output),
            Err(ConfigureError::IncompleteTrack {
                track: 2,
                field: "samples_per_frame"
            })
        ));

        let mut input = input_track();
        input.sample_rate = 0;
        assert!(matches!(
            stage.configure(&input, &output_track()),
            Err(ConfigureError::IncompleteTrack {
                track: 1,
                field: "sample_rate"
            })
        ));
    }

    #[test]
    fn test_engine_configure_failure() {
        let (engine, events) = MockEngine::new(Behavior {
            fail_configure: Some(EngineError::ChainParse(
                crate::error::ChainParseError::UnknownFilter("asettb".to_string()),
            )),
            ..Default::default()
        });
        let mut stage = Resampler::new(engine);

        let result = stage.configure(&input_track(), &output_track());
        assert!(matches!(result, Err(ConfigureError::ChainParse { .. })));
        assert_eq!(stage.state(), StageState::Unconfigured);
        assert_eq!(stage.filter_chain(), None);
        assert_eq!(events.lock().unwrap().last().map(String::as_str), Some("release"));
        assert!(matches!(stage.start(), Err(StageError::NotConfigured(StageState::Unconfigured))));
    }

    #[test]
    fn test_lifecycle_misuse() {
        let (engine, _) = MockEngine::new(one_output());
        let mut stage = Resampler::new(engine);
        assert!(matches!(stage.start(), Err(StageError::NotConfigured(_))));

        stage.configure(&input_track(), &output_track()).unwrap();
        stage.start().unwrap();
        assert!(matches!(stage.start(), Err(StageError::AlreadyRunning)));
        assert!(matches!(
            stage.configure(&input_track(), &output_track()),
            Err(ConfigureError::InvalidState(StageState::Running))
        ));
        assert!(matches!(
            stage.set_complete_handler(|_| {}),
            Err(StageError::AlreadyRunning)
        ));

        stage.stop();
        // Restart requires a fresh configuration
        assert!(matches!(stage.start(), Err(StageError::NotConfigured(StageState::Stopped))));
    }

    #[test]
    fn test_reconfigure_and_restart() {
        let (mut stage, outputs, events) = stage(one_output());
        stage.start().unwrap();
        stage.send_buffer(frame(1)).unwrap();
        stage.stop();

        stage.configure(&input_track(), &output_track()).unwrap();
        stage.start().unwrap();
        stage.send_buffer(frame(2)).unwrap();
        stage.stop();

        assert_eq!(*outputs.lock().unwrap(), vec![10, 20]);
        let configures = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("configure"))
            .count();
        assert_eq!(configures, 2);
    }

    #[test]
    fn test_frames_sent_after_stop_are_discarded() {
        let (mut stage, outputs, _) = stage(one_output());
        stage.start().unwrap();
        stage.send_buffer(frame(1)).unwrap();
        stage.stop();

        stage.send_buffer(frame(5)).unwrap();
        stage.send_buffer(frame(6)).unwrap();
        assert_eq!(stage.queue().len(), 2);

        stage.configure(&input_track(), &output_track()).unwrap();
        assert!(stage.queue().is_empty());
        stage.start().unwrap();
        stage.send_buffer(frame(2)).unwrap();
        stage.stop();

        assert_eq!(*outputs.lock().unwrap(), vec![10, 20]);
    }

    #[test]
    fn test_invalid_thread_name_fails_start() {
        let (engine, _) = MockEngine::new(one_output());
        let config = StageConfig {
            thread_name: "resampler\0".to_string(),
            ..StageConfig::default()
        };
        let mut stage = Resampler::with_config(engine, config);
        stage.configure(&input_track(), &output_track()).unwrap();

        assert!(matches!(stage.start(), Err(StageError::Config(_))));
        assert_eq!(stage.state(), StageState::Configured);
        assert!(!stage.is_worker_alive());

        // The engine stays with the stage
        stage.configure(&input_track(), &output_track()).unwrap();
    }

    #[test]
    fn test_backpressure_free_producer() {
        let (mut stage, _, _) = stage(one_output());
        stage.start().unwrap();
        stage.stop();

        let started = Instant::now();
        for pts in 0..10_000 {
            stage.send_buffer(frame(pts)).unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(stage.queue().len(), 10_000);
        assert_eq!(stage.health().frames_received(), 10_000);
    }

    #[test]
    fn test_push_failure_drops_single_frame() {
        let (mut stage, outputs, _) = stage(Behavior {
            outputs_per_push: 1,
            fail_push: vec![2],
            ..Default::default()
        });
        stage.start().unwrap();
        for pts in 0..5 {
            stage.send_buffer(frame(pts)).unwrap();
        }
        stage.stop();

        assert_eq!(*outputs.lock().unwrap(), vec![0, 10, 30, 40]);
        assert_eq!(stage.health().push_failures(), 1);
        assert_eq!(stage.health().frames_pushed(), 4);
    }

    #[test]
    fn test_export_failure_skips_single_output() {
        let (mut stage, outputs, _) = stage(Behavior {
            outputs_per_push: 2,
            fail_export: vec![11],
            ..Default::default()
        });
        stage.start().unwrap();
        stage.send_buffer(frame(1)).unwrap();
        stage.send_buffer(frame(2)).unwrap();
        stage.stop();

        assert_eq!(*outputs.lock().unwrap(), vec![10, 20, 21]);
        assert_eq!(stage.health().conversion_failures(), 1);
    }

    #[test]
    fn test_import_failure_stops_worker() {
        let (mut stage, outputs, _) = stage(Behavior {
            outputs_per_push: 1,
            fail_import: Some(2),
            ..Default::default()
        });
        stage.start().unwrap();
        for pts in 0..5 {
            stage.send_buffer(frame(pts)).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while stage.is_worker_alive() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!stage.is_worker_alive());
        assert_eq!(stage.state(), StageState::Running);
        assert_eq!(stage.health().fatal_errors(), 1);
        assert_eq!(stage.health().frame_drops(), 1);

        // Later frames stay queued, nothing drains them
        stage.send_buffer(frame(5)).unwrap();
        assert_eq!(stage.queue().len(), 3);

        stage.stop();
        assert_eq!(*outputs.lock().unwrap(), vec![0, 10]);
        assert_eq!(stage.state(), StageState::Stopped);
    }

    #[test]
    fn test_end_of_stream_keeps_worker_running() {
        let (mut stage, outputs, _) = stage(Behavior {
            outputs_per_push: 1,
            end_of_stream_on: vec![1],
            ..Default::default()
        });
        stage.start().unwrap();
        for pts in 0..3 {
            stage.send_buffer(frame(pts)).unwrap();
        }
        stage.stop();

        // The frame pending at end of stream is drained on the next cycle
        assert_eq!(*outputs.lock().unwrap(), vec![0, 10, 20]);
        assert_eq!(stage.health().end_of_streams(), 1);
    }

    #[test]
    fn test_pull_error_ends_drain_cycle() {
        let (mut stage, outputs, _) = stage(Behavior {
            outputs_per_push: 2,
            pull_error_on: vec![1],
            ..Default::default()
        });
        stage.start().unwrap();
        for pts in 0..3 {
            stage.send_buffer(frame(pts)).unwrap();
        }
        stage.stop();

        assert_eq!(*outputs.lock().unwrap(), vec![0, 1, 10, 11, 20, 21]);
        assert_eq!(stage.health().pull_errors(), 1);
    }

    #[test]
    fn test_concurrent_producers() {
        let (mut stage, outputs, _) = stage(one_output());
        stage.start().unwrap();

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let sender = stage.sender();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        sender.send(frame(p * 1000 + i));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        stage.stop();

        let outputs = outputs.lock().unwrap();
        assert_eq!(outputs.len(), 1000);
        // Per-producer order is preserved
        for p in 0..4 {
            let own: Vec<i64> = outputs
                .iter()
                .copied()
                .filter(|pts| pts / 10_000 == p)
                .collect();
            let expected: Vec<i64> = (0..250).map(|i| (p * 1000 + i) * 10).collect();
            assert_eq!(own, expected);
        }
    }

    #[test]
    fn test_panicking_callback_loses_engine() {
        let (engine, _) = MockEngine::new(one_output());
        let mut stage = Resampler::new(engine).with_complete_handler(|_| panic!("callback failure"));
        stage.configure(&input_track(), &output_track()).unwrap();
        stage.start().unwrap();
        stage.send_buffer(frame(0)).unwrap();
        stage.stop();

        assert_eq!(stage.state(), StageState::Stopped);
        assert!(matches!(
            stage.configure(&input_track(), &output_track()),
            Err(ConfigureError::EngineUnavailable)
        ));
    }

    #[test]
    fn test_drop_releases_engine() {
        let (mut stage, _, events) = stage(one_output());
        stage.start().unwrap();
        stage.send_buffer(frame(0)).unwrap();
        drop(stage);

        assert_eq!(events.lock().unwrap().last().map(String::as_str), Some("release"));
    }

    #[test]
    fn test_worker_thread_name() {
        let (engine, _) = MockEngine::new(one_output());
        let names = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&names);
        let config = StageConfig {
            thread_name: "resampler-7".to_string(),
            ..Default::default()
        };
        let mut stage = Resampler::with_config(engine, config).with_complete_handler(move |_| {
            let name = std::thread::current().name().map(str::to_string);
            sink.lock().unwrap().push(name);
        });
        stage.configure(&input_track(), &output_track()).unwrap();
        stage.start().unwrap();
        stage.send_buffer(frame(0)).unwrap();
        stage.stop();

        assert_eq!(*names.lock().unwrap(), vec![Some("resampler-7".to_string())]);
    }

    #[test]
    fn test_native_engine_end_to_end() {
        let outputs = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outputs);
        let mut stage = Resampler::new(NativeEngine::new()).with_complete_handler(move |frame| {
            sink.lock().unwrap().push(frame);
        });
        let input = MediaTrack::audio(1, 44100, SampleFormat::S16, ChannelLayout::Stereo, 0);
        stage.configure(&input, &output_track()).unwrap();
        stage.start().unwrap();

        // One second of audio in 10ms frames
        for i in 0..100 {
            let data = vec![0u8; 441 * 2 * 2];
            stage
                .send_buffer(MediaFrame::audio(
                    Bytes::from(data),
                    i * 441,
                    input.time_base,
                    44100,
                    SampleFormat::S16,
                    ChannelLayout::Stereo,
                    441,
                ))
                .unwrap();
        }
        stage.stop();

        let outputs = outputs.lock().unwrap();
        assert!((45..=46).contains(&outputs.len()), "got {} frames", outputs.len());
        for (i, frame) in outputs.iter().enumerate() {
            assert_eq!(frame.nb_samples, 1024);
            assert_eq!(frame.sample_format, SampleFormat::Fltp);
            assert_eq!(frame.channel_layout, ChannelLayout::Stereo);
            assert_eq!(frame.time_base, Timebase::new(1, 48000));
            assert_eq!(frame.pts, i as i64 * 1024);
            assert_eq!(frame.size(), 1024 * 2 * 4);
        }
        assert_eq!(stage.health().frame_drops(), 0);
    }
}
