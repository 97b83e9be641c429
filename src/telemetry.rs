//! Pipeline counters and the periodic status reporter.
//!
//! Every counter is a relaxed atomic written by exactly one stage and read by
//! anyone. They carry no ordering relative to the data path.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::info;

use crate::error::{Result, StreamError};

/// Shared counters, one struct per pipeline.
#[derive(Debug, Default)]
pub struct Telemetry {
    // capture
    pub frames_captured: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub capture_errors: AtomicU64,
    pub pool_exhausted: AtomicU64,
    peak_amplitude: AtomicU32,
    // processing
    pub frames_processed: AtomicU64,
    pub strategy_failures: AtomicU64,
    pub over_budget: AtomicU64,
    pub batches_sealed: AtomicU64,
    // transmit
    pub batches_sent: AtomicU64,
    pub send_failures: AtomicU64,
    pub dropped_disconnected: AtomicU64,
    pub connects: AtomicU64,
    pub disconnects: AtomicU64,
    pub connect_failures: AtomicU64,
    // playback
    pub playback_written: AtomicU64,
    pub playback_errors: AtomicU64,
}

impl Telemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a frame peak; keeps the maximum since the last `take_peak`.
    pub fn record_peak(&self, peak: u16) {
        self.peak_amplitude
            .fetch_max(u32::from(peak), Ordering::Relaxed);
    }

    /// Current counter values. Queue eviction counts are owned by the queues
    /// themselves and attached with `with_evictions`.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        TelemetrySnapshot {
            frames_captured: get(&self.frames_captured),
            frames_dropped: get(&self.frames_dropped),
            capture_errors: get(&self.capture_errors),
            pool_exhausted: get(&self.pool_exhausted),
            peak_amplitude: self.peak_amplitude.load(Ordering::Relaxed) as u16,
            frames_processed: get(&self.frames_processed),
            strategy_failures: get(&self.strategy_failures),
            over_budget: get(&self.over_budget),
            batches_sealed: get(&self.batches_sealed),
            batches_sent: get(&self.batches_sent),
            send_failures: get(&self.send_failures),
            dropped_disconnected: get(&self.dropped_disconnected),
            connects: get(&self.connects),
            disconnects: get(&self.disconnects),
            connect_failures: get(&self.connect_failures),
            playback_written: get(&self.playback_written),
            playback_errors: get(&self.playback_errors),
            output_evictions: 0,
            playback_evictions: 0,
        }
    }

    /// Returns the peak since the previous call and starts a new window.
    pub fn take_peak(&self) -> u16 {
        self.peak_amplitude.swap(0, Ordering::Relaxed) as u16
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub capture_errors: u64,
    pub pool_exhausted: u64,
    pub peak_amplitude: u16,
    pub frames_processed: u64,
    pub strategy_failures: u64,
    pub over_budget: u64,
    pub batches_sealed: u64,
    pub batches_sent: u64,
    pub send_failures: u64,
    pub dropped_disconnected: u64,
    pub connects: u64,
    pub disconnects: u64,
    pub connect_failures: u64,
    pub playback_written: u64,
    pub playback_errors: u64,
    pub output_evictions: u64,
    pub playback_evictions: u64,
}

impl TelemetrySnapshot {
    pub fn with_evictions(mut self, output: u64, playback: u64) -> Self {
        self.output_evictions = output;
        self.playback_evictions = playback;
        self
    }
}

/// Spawns the reporter thread. It logs one `info!` line per interval until
/// `running` clears. `sample` supplies the snapshot, so queue-owned counters
/// can be folded in by the caller.
pub fn spawn_reporter<F>(
    interval: Duration,
    running: Arc<AtomicBool>,
    sample: F,
) -> Result<JoinHandle<()>>
where
    F: Fn() -> TelemetrySnapshot + Send + 'static,
{
    thread::Builder::new()
        .name("pcmlink-telemetry".to_string())
        .spawn(move || {
            let tick = Duration::from_millis(100).min(interval);
            let mut last = Instant::now();
            let mut previous = TelemetrySnapshot::default();
            while running.load(Ordering::SeqCst) {
                thread::sleep(tick);
                if last.elapsed() < interval {
                    continue;
                }
                let elapsed = last.elapsed().as_secs_f64();
                last = Instant::now();
                let snap = sample();
                let sent = snap.batches_sent.saturating_sub(previous.batches_sent);
                info!(
                    captured = snap.frames_captured,
                    dropped = snap.frames_dropped,
                    capture_errors = snap.capture_errors,
                    evicted = snap.output_evictions,
                    sent = snap.batches_sent,
                    send_failures = snap.send_failures,
                    reconnects = snap.connects.saturating_sub(1),
                    peak = snap.peak_amplitude,
                    batches_per_sec = format!("{:.1}", sent as f64 / elapsed),
                    "pipeline status"
                );
                previous = snap;
            }
        })
        .map_err(|e| StreamError::Spawn {
            task: "telemetry".to_string(),
            message: e.to_string(),
        })
}
