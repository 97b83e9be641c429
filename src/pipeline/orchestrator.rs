//! Streaming pipeline that runs from startup until shutdown.
//!
//! ```text
//! capture --frame queue--> process --output queue--> transmit --> network
//!                             \--playback queue--> playback sink
//! ```
//!
//! Shutdown cascades through the queues: capture stops and drops its sender,
//! processing drains and closes its outputs, and each consumer exits once its
//! queue is closed and empty.

use crate::audio::source::SampleSource;
use crate::config::Config;
use crate::defaults::{
    DEFAULT_SCALE, FRAME_PERIOD_US, FRAME_QUEUE_DEPTH, OUTPUT_QUEUE_DEPTH,
    PLAYBACK_QUEUE_DEPTH, POOL_MARGIN, READ_TIMEOUT_MS,
};
use crate::error::{Result, StreamError};
use crate::pipeline::assembler::BatchAssembler;
use crate::pipeline::capture::CaptureStage;
use crate::pipeline::clock::{Clock, DeviceClock, SystemClock};
use crate::pipeline::error::{ErrorReporter, LogReporter};
use crate::pipeline::output_queue::EvictingQueue;
use crate::pipeline::playback::{PlaybackSink, PlaybackStation};
use crate::pipeline::pool::{BufferPool, PoolSizing};
use crate::pipeline::processing::ProcessingStation;
use crate::pipeline::queue::bounded_queue;
use crate::pipeline::station::{NullOutlet, StationRunner};
use crate::pipeline::strategy::{ProcessingStrategy, init_with_fallback};
use crate::pipeline::types::{Batch, PlaybackFrame};
use crate::protocol::validate_layout;
use crate::telemetry::{Telemetry, TelemetrySnapshot, spawn_reporter};
use crate::transport::{Endpoint, SenderConfig, TransmitSender, Transport};
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Configuration for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub frame_queue_depth: usize,
    pub output_queue_depth: usize,
    /// Playback queue depth, used only when a playback sink is given.
    pub playback_queue_depth: usize,
    /// Explicit pool size; computed from the depths when `None`.
    pub pool_capacity: Option<usize>,
    pub pool_margin: usize,
    pub read_timeout: Duration,
    /// Processing time above which a frame is flagged over budget.
    pub frame_budget: Duration,
    /// Scale used when a model strategy fails to initialise.
    pub fallback_scale: f32,
    pub sender: SenderConfig,
    /// `None` disables the status reporter.
    pub report_interval: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        let transmit = &config.transmit;
        let mut sender = SenderConfig::new(Endpoint::new(
            &transmit.host,
            transmit.port,
            &transmit.path,
        ));
        sender.reconnect_interval = Duration::from_millis(transmit.reconnect_interval_ms);
        sender.connect_timeout = Duration::from_millis(transmit.connect_timeout_ms);
        sender.policy = transmit.disconnect_policy;
        sender.device_name = transmit.device_name.clone();
        sender.strategy_name = config.strategy.kind.as_str().to_string();

        let report_secs = config.telemetry.report_interval_secs;
        Self {
            frame_queue_depth: config.pipeline.frame_queue_depth,
            output_queue_depth: config.pipeline.output_queue_depth,
            playback_queue_depth: config.playback.queue_depth,
            pool_capacity: config.pipeline.pool_capacity,
            pool_margin: config.pipeline.pool_margin,
            read_timeout: Duration::from_millis(config.audio.read_timeout_ms),
            frame_budget: Duration::from_micros(FRAME_PERIOD_US),
            fallback_scale: config.strategy.scale,
            sender,
            report_interval: (report_secs > 0).then(|| Duration::from_secs(report_secs)),
        }
    }

    /// Default depths with fast link timings and no reporter, for tests.
    pub fn compact() -> Self {
        let mut sender = SenderConfig::new(Endpoint::new("127.0.0.1", 8080, "/esp32"));
        sender.connect_timeout = Duration::from_millis(500);
        sender.reconnect_interval = Duration::from_millis(50);
        sender.poll_interval = Duration::from_millis(10);
        Self {
            frame_queue_depth: FRAME_QUEUE_DEPTH,
            output_queue_depth: OUTPUT_QUEUE_DEPTH,
            playback_queue_depth: PLAYBACK_QUEUE_DEPTH,
            pool_capacity: None,
            pool_margin: POOL_MARGIN,
            read_timeout: Duration::from_millis(READ_TIMEOUT_MS),
            frame_budget: Duration::from_micros(FRAME_PERIOD_US),
            fallback_scale: DEFAULT_SCALE,
            sender,
            report_interval: None,
        }
    }

    fn pool_sizing(&self, with_playback: bool) -> PoolSizing {
        PoolSizing {
            frame_queue_depth: self.frame_queue_depth,
            output_queue_depth: self.output_queue_depth,
            playback_queue_depth: if with_playback {
                self.playback_queue_depth
            } else {
                0
            },
            margin: self.pool_margin,
        }
    }
}

/// A pipeline thread, joinable without blocking on an unfinished one.
enum Worker {
    Thread(&'static str, JoinHandle<()>),
    Process(StationRunner<ProcessingStation>),
    Playback(StationRunner<PlaybackStation>),
}

impl Worker {
    fn name(&self) -> &'static str {
        match self {
            Self::Thread(name, _) => *name,
            Self::Process(runner) => runner.name(),
            Self::Playback(runner) => runner.name(),
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            Self::Thread(_, handle) => handle.is_finished(),
            Self::Process(runner) => runner.is_finished(),
            Self::Playback(runner) => runner.is_finished(),
        }
    }

    fn join(self) -> std::result::Result<(), String> {
        match self {
            Self::Thread(name, handle) => handle
                .join()
                .map_err(|panic| format!("{name} thread panicked: {}", panic_message(&*panic))),
            Self::Process(runner) => runner.join(),
            Self::Playback(runner) => runner.join(),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap_or("unknown panic")
}

/// Joins finished workers until all are done or `deadline` passes.
/// Returns the ones still running.
fn join_until(mut workers: Vec<Worker>, deadline: Instant) -> Vec<Worker> {
    let poll_interval = Duration::from_millis(20);
    loop {
        let mut remaining = Vec::new();
        for worker in workers.drain(..) {
            if worker.is_finished() {
                if let Err(msg) = worker.join() {
                    error!("pipeline {msg}");
                }
            } else {
                remaining.push(worker);
            }
        }
        workers = remaining;

        if workers.is_empty() || Instant::now() >= deadline {
            return workers;
        }
        thread::sleep(poll_interval);
    }
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    /// Cleared to stop capture; everything downstream drains after it.
    running: Arc<AtomicBool>,
    /// Cleared to stop the sender and the reporter outright.
    link_running: Arc<AtomicBool>,
    workers: Vec<Worker>,
    reporter: Option<JoinHandle<()>>,
    telemetry: Arc<Telemetry>,
    output: EvictingQueue<Batch>,
    playback: Option<EvictingQueue<PlaybackFrame>>,
    drain_grace: Duration,
}

impl PipelineHandle {
    /// Stops the pipeline gracefully and returns the final counters.
    ///
    /// Capture stops first and the remaining stages drain. The sender gets
    /// `drain_grace` to flush; after that it is told to stop, and any thread
    /// still running a second later is detached.
    pub fn stop(mut self) -> TelemetrySnapshot {
        self.running.store(false, Ordering::SeqCst);
        let workers = std::mem::take(&mut self.workers);
        let remaining = join_until(workers, Instant::now() + self.drain_grace);
        self.finish(remaining)
    }

    /// Blocks until a finite source is exhausted and every stage has drained.
    pub fn wait(mut self) -> TelemetrySnapshot {
        for worker in std::mem::take(&mut self.workers) {
            if let Err(msg) = worker.join() {
                error!("pipeline {msg}");
            }
        }
        self.running.store(false, Ordering::SeqCst);
        self.finish(Vec::new())
    }

    fn finish(mut self, remaining: Vec<Worker>) -> TelemetrySnapshot {
        self.link_running.store(false, Ordering::SeqCst);
        let remaining = join_until(remaining, Instant::now() + Duration::from_secs(1));
        if !remaining.is_empty() {
            let names: Vec<&str> = remaining.iter().map(Worker::name).collect();
            warn!(threads = ?names, "shutdown timeout, detaching");
        }
        if let Some(reporter) = self.reporter.take()
            && reporter.join().is_err()
        {
            error!("telemetry reporter panicked");
        }

        let snapshot = self.snapshot();
        info!(
            captured = snapshot.frames_captured,
            dropped = snapshot.frames_dropped,
            sealed = snapshot.batches_sealed,
            sent = snapshot.batches_sent,
            evicted = snapshot.output_evictions,
            "pipeline stopped"
        );
        snapshot
    }

    /// Current counters, including the queues' eviction counts.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot().with_evictions(
            self.output.evictions(),
            self.playback.as_ref().map_or(0, EvictingQueue::evictions),
        )
    }

    /// Returns true until `stop` is requested.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether every pipeline stage has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(Worker::is_finished)
    }
}

/// Streaming pipeline: SampleSource → Strategy + Assembler → Transport.
pub struct Pipeline {
    config: PipelineConfig,
    error_reporter: Arc<dyn ErrorReporter>,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    /// Creates a new pipeline with default error reporter.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            error_reporter: Arc::new(LogReporter),
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets a custom error reporter.
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = reporter;
        self
    }

    /// Sets a custom clock (for deterministic testing).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Starts every stage.
    ///
    /// Fails only on fatal startup problems: a wire layout mismatch, an
    /// undersized buffer pool or a thread that cannot be spawned. A strategy
    /// that fails to initialise is replaced, not reported.
    pub fn start(
        self,
        source: Box<dyn SampleSource>,
        strategy: Box<dyn ProcessingStrategy>,
        transport: Box<dyn Transport>,
        playback: Option<Box<dyn PlaybackSink>>,
    ) -> Result<PipelineHandle> {
        validate_layout()?;

        let sizing = self.config.pool_sizing(playback.is_some());
        let capacity = sizing.resolve(self.config.pool_capacity)?;
        let pool = BufferPool::new(capacity);

        let strategy = init_with_fallback(strategy, self.config.fallback_scale);
        let mut sender_config = self.config.sender.clone();
        sender_config.strategy_name = strategy.name().to_string();

        let running = Arc::new(AtomicBool::new(true));
        let link_running = Arc::new(AtomicBool::new(true));
        let telemetry = Telemetry::new();
        let device_clock = DeviceClock::new(self.clock.clone());

        let (frame_tx, frame_rx) = bounded_queue(self.config.frame_queue_depth);
        let output = EvictingQueue::new(self.config.output_queue_depth);
        let playback_queue = playback
            .as_ref()
            .map(|_| EvictingQueue::new(self.config.playback_queue_depth));

        info!(
            strategy = strategy.name(),
            pool = capacity,
            frame_queue = self.config.frame_queue_depth,
            output_queue = self.config.output_queue_depth,
            playback = playback_queue.is_some(),
            "starting pipeline"
        );

        let mut workers = Vec::new();

        // Consumers first, so nothing is produced into a queue with no reader.
        let mut station = ProcessingStation::new(
            strategy,
            BatchAssembler::new(device_clock.clone()),
            pool.clone(),
            telemetry.clone(),
            self.clock.clone(),
        )
        .with_frame_budget(self.config.frame_budget);
        if let Some(queue) = &playback_queue {
            station = station.with_playback(queue.clone());
        }
        workers.push(Worker::Process(StationRunner::spawn(
            station,
            frame_rx,
            output.clone(),
            self.error_reporter.clone(),
            "pcmlink-process",
        )?));

        if let (Some(sink), Some(queue)) = (playback, &playback_queue) {
            workers.push(Worker::Playback(StationRunner::spawn(
                PlaybackStation::new(sink, telemetry.clone()),
                queue.clone(),
                NullOutlet,
                self.error_reporter.clone(),
                "pcmlink-playback",
            )?));
        }

        let sender = TransmitSender::new(sender_config, transport, output.clone(), telemetry.clone());
        workers.push(Worker::Thread(
            "transmit",
            sender.spawn(link_running.clone())?,
        ));

        let capture = CaptureStage::new(source, frame_tx, pool, telemetry.clone(), device_clock)
            .with_read_timeout(self.config.read_timeout);
        let capture_running = running.clone();
        let capture_handle = thread::Builder::new()
            .name("pcmlink-capture".to_string())
            .spawn(move || capture.run(&capture_running))
            .map_err(|e| StreamError::Spawn {
                task: "capture".to_string(),
                message: e.to_string(),
            })?;
        workers.push(Worker::Thread("capture", capture_handle));

        let reporter = match self.config.report_interval {
            Some(interval) => {
                let counters = telemetry.clone();
                let out = output.clone();
                let play = playback_queue.clone();
                Some(spawn_reporter(interval, link_running.clone(), move || {
                    let mut snap = counters.snapshot().with_evictions(
                        out.evictions(),
                        play.as_ref().map_or(0, EvictingQueue::evictions),
                    );
                    snap.peak_amplitude = counters.take_peak();
                    snap
                })?)
            }
            None => None,
        };

        Ok(PipelineHandle {
            running,
            link_running,
            workers,
            reporter,
            telemetry,
            output,
            playback: playback_queue,
            drain_grace: self.config.sender.connect_timeout + Duration::from_secs(1),
        })
    }
}
