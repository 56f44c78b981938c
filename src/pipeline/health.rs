//! Health monitoring and metrics for pipeline stages

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Health metrics for a stage
///
/// Per-frame failures never surface through the producer API, so this is
/// where dropped frames and worker failures become observable.
/// All fields use atomic operations for thread-safe access.
pub struct StageHealth {
    /// Frames accepted from producers
    pub frames_received: AtomicU64,

    /// Frames accepted by the filter engine
    pub frames_pushed: AtomicU64,

    /// Frames handed to the completion callback
    pub frames_emitted: AtomicU64,

    /// Frames the filter engine refused
    pub push_failures: AtomicU64,

    /// Errors reported while draining the filter engine
    pub pull_errors: AtomicU64,

    /// Output frames that could not be converted back
    pub conversion_failures: AtomicU64,

    /// End-of-stream signals from the filter engine
    pub end_of_streams: AtomicU64,

    /// Errors that terminated the worker
    pub fatal_errors: AtomicU64,

    /// Timestamp (as Unix microseconds) of the last emitted frame
    pub last_frame_time: AtomicU64,
}

impl StageHealth {
    pub fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            frames_pushed: AtomicU64::new(0),
            frames_emitted: AtomicU64::new(0),
            push_failures: AtomicU64::new(0),
            pull_errors: AtomicU64::new(0),
            conversion_failures: AtomicU64::new(0),
            end_of_streams: AtomicU64::new(0),
            fatal_errors: AtomicU64::new(0),
            last_frame_time: AtomicU64::new(now_micros()),
        }
    }

    pub fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pushed(&self) {
        self.frames_pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self) {
        self.last_frame_time.store(now_micros(), Ordering::Relaxed);
        self.frames_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_push_failure(&self) {
        self.push_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pull_error(&self) {
        self.pull_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conversion_failure(&self) {
        self.conversion_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_end_of_stream(&self) {
        self.end_of_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fatal(&self) {
        self.fatal_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn frames_pushed(&self) -> u64 {
        self.frames_pushed.load(Ordering::Relaxed)
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted.load(Ordering::Relaxed)
    }

    pub fn push_failures(&self) -> u64 {
        self.push_failures.load(Ordering::Relaxed)
    }

    pub fn pull_errors(&self) -> u64 {
        self.pull_errors.load(Ordering::Relaxed)
    }

    pub fn conversion_failures(&self) -> u64 {
        self.conversion_failures.load(Ordering::Relaxed)
    }

    pub fn end_of_streams(&self) -> u64 {
        self.end_of_streams.load(Ordering::Relaxed)
    }

    pub fn fatal_errors(&self) -> u64 {
        self.fatal_errors.load(Ordering::Relaxed)
    }

    pub fn last_frame_time(&self) -> u64 {
        self.last_frame_time.load(Ordering::Relaxed)
    }

    /// Frames lost to push or conversion failures, plus the frame in flight
    /// when the worker hit a fatal error
    pub fn frame_drops(&self) -> u64 {
        self.push_failures() + self.conversion_failures() + self.fatal_errors()
    }

    /// Dropped frames as a percentage of received frames
    pub fn frame_drop_rate(&self) -> f64 {
        let received = self.frames_received();
        if received == 0 {
            return 0.0;
        }
        (self.frame_drops() as f64 / received as f64) * 100.0
    }

    /// Check if the stage has stalled (no output for given duration)
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let elapsed_micros = now_micros().saturating_sub(self.last_frame_time());
        elapsed_micros > threshold.as_micros() as u64
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            frames_received: self.frames_received(),
            frames_pushed: self.frames_pushed(),
            frames_emitted: self.frames_emitted(),
            frame_drops: self.frame_drops(),
            pull_errors: self.pull_errors(),
            end_of_streams: self.end_of_streams(),
            fatal_errors: self.fatal_errors(),
            frame_drop_rate: self.frame_drop_rate(),
        }
    }
}

impl Default for StageHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub frames_received: u64,
    pub frames_pushed: u64,
    pub frames_emitted: u64,
    pub frame_drops: u64,
    pub pull_errors: u64,
    pub end_of_streams: u64,
    pub fatal_errors: u64,
    pub frame_drop_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} in, {} pushed, {} out ({} drops, {:.2}%), {} pull errors, {} eos, {} fatal",
            self.frames_received,
            self.frames_pushed,
            self.frames_emitted,
            self.frame_drops,
            self.frame_drop_rate,
            self.pull_errors,
            self.end_of_streams,
            self.fatal_errors
        )
    }
}

/// Health alert types
#[derive(Debug, Clone, PartialEq)]
pub enum HealthAlert {
    /// No output for the stall threshold
    Stalled { duration: Duration },

    /// High frame drop rate detected
    HighDropRate { rate: f64 },

    /// Input queue grew past its threshold
    QueueBacklog { depth: usize, threshold: usize },

    /// The worker exited on an unrecoverable error
    WorkerFailed { count: u64 },
}

impl std::fmt::Display for HealthAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthAlert::Stalled { duration } => {
                write!(f, "Stage stalled for {:?}", duration)
            }
            HealthAlert::HighDropRate { rate } => {
                write!(f, "High frame drop rate: {:.2}%", rate)
            }
            HealthAlert::QueueBacklog { depth, threshold } => {
                write!(f, "Queue backlog: {} frames (threshold {})", depth, threshold)
            }
            HealthAlert::WorkerFailed { count } => {
                write!(f, "Worker failed: {} fatal errors", count)
            }
        }
    }
}

/// Source of the current input backlog
pub trait QueueProbe: Send + Sync {
    fn depth(&self) -> usize;
    fn threshold(&self) -> usize;
}

/// Health monitoring service
///
/// Periodically checks stage health and sends alerts when issues are detected.
pub struct HealthMonitor {
    health: Arc<StageHealth>,
    queue: Option<Arc<dyn QueueProbe>>,
    alert_tx: mpsc::Sender<HealthAlert>,
    check_interval: Duration,
    stall_threshold: Duration,
    drop_rate_threshold: f64,
}

impl HealthMonitor {
    pub fn new(health: Arc<StageHealth>, alert_tx: mpsc::Sender<HealthAlert>) -> Self {
        Self {
            health,
            queue: None,
            alert_tx,
            check_interval: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(5),
            drop_rate_threshold: 10.0, // 10% drop rate
        }
    }

    /// Watch the backlog of an input queue
    pub fn with_queue(mut self, queue: Arc<dyn QueueProbe>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    pub fn with_drop_rate_threshold(mut self, threshold: f64) -> Self {
        self.drop_rate_threshold = threshold;
        self
    }

    /// Run the health monitor until the alert receiver is dropped
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.check_interval);
        let mut last_fatal_errors = 0u64;

        loop {
            interval.tick().await;

            let mut alerts = Vec::new();

            if self.health.frames_received() > 0 && self.health.is_stalled(self.stall_threshold) {
                alerts.push(HealthAlert::Stalled {
                    duration: self.stall_threshold,
                });
            }

            let drop_rate = self.health.frame_drop_rate();
            if drop_rate > self.drop_rate_threshold {
                alerts.push(HealthAlert::HighDropRate { rate: drop_rate });
            }

            if let Some(queue) = &self.queue {
                let (depth, threshold) = (queue.depth(), queue.threshold());
                if threshold > 0 && depth > threshold {
                    alerts.push(HealthAlert::QueueBacklog { depth, threshold });
                }
            }

            let fatal_errors = self.health.fatal_errors();
            if fatal_errors > last_fatal_errors {
                alerts.push(HealthAlert::WorkerFailed {
                    count: fatal_errors - last_fatal_errors,
                });
                last_fatal_errors = fatal_errors;
            }

            for alert in alerts {
                if self.alert_tx.send(alert).await.is_err() {
                    return;
                }
            }
        }
    }
}
