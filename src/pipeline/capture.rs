//! Capture stage: pulls one frame per period from the sample source and
//! offers it to the frame queue without ever waiting.

use crate::audio::source::{SampleSource, WORD_BYTES};
use crate::defaults::{FRAME_PERIOD_US, FRAME_SAMPLES, HIGH_NOISE_PEAK};
use crate::pipeline::clock::DeviceClock;
use crate::pipeline::pool::BufferPool;
use crate::pipeline::queue::{QueueSender, TrySendError};
use crate::pipeline::types::{Frame, FrameFlags};
use crate::telemetry::Telemetry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Log the first failure of a streak and then every Nth.
const ERROR_LOG_EVERY: u64 = 100;

/// Outcome of one capture period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStep {
    /// The frame went into the queue.
    Sent,
    /// The frame was dropped: queue full or no free buffer.
    Dropped,
    /// The source read failed or came back short; nothing was produced.
    ReadFailed,
    /// A finite source has no more data.
    Exhausted,
    /// The consumer is gone.
    Closed,
}

pub struct CaptureStage {
    source: Box<dyn SampleSource>,
    frame_tx: QueueSender<Frame>,
    pool: BufferPool,
    telemetry: Arc<Telemetry>,
    clock: DeviceClock,
    read_timeout: Duration,
    next_seq: u32,
    overflow_pending: bool,
    error_streak: u64,
    scratch: Vec<i32>,
}

impl CaptureStage {
    pub fn new(
        source: Box<dyn SampleSource>,
        frame_tx: QueueSender<Frame>,
        pool: BufferPool,
        telemetry: Arc<Telemetry>,
        clock: DeviceClock,
    ) -> Self {
        Self {
            source,
            frame_tx,
            pool,
            telemetry,
            clock,
            read_timeout: Duration::from_millis(crate::defaults::READ_TIMEOUT_MS),
            next_seq: 0,
            overflow_pending: false,
            error_streak: 0,
            scratch: vec![0; FRAME_SAMPLES],
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Runs one capture period.
    pub fn step(&mut self) -> CaptureStep {
        let bytes = match self.source.read(&mut self.scratch, self.read_timeout) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.read_failed(&e.to_string());
                return CaptureStep::ReadFailed;
            }
        };

        if bytes == 0 && self.source.is_finite() {
            return CaptureStep::Exhausted;
        }
        let expected = FRAME_SAMPLES * WORD_BYTES;
        if bytes < expected {
            self.read_failed(&format!("short read: {bytes} of {expected} bytes"));
            return CaptureStep::ReadFailed;
        }
        self.error_streak = 0;

        let captured_at_ms = self.clock.millis();
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        Telemetry::incr(&self.telemetry.frames_captured);

        let Some(mut raw) = self.pool.acquire() else {
            Telemetry::incr(&self.telemetry.pool_exhausted);
            self.frame_dropped(seq, "buffer pool exhausted");
            return CaptureStep::Dropped;
        };

        let mut peak: u16 = 0;
        for (out, &word) in raw.iter_mut().zip(&self.scratch) {
            // 24-bit audio sits in the top of the word; keep the upper 16 bits.
            let sample = (word >> 16) as i16;
            peak = peak.max(sample.unsigned_abs());
            *out = sample;
        }
        self.telemetry.record_peak(peak);

        let mut frame = Frame::new(seq, captured_at_ms, raw);
        frame.peak = peak;
        if peak >= HIGH_NOISE_PEAK {
            frame.flags.insert(FrameFlags::HIGH_NOISE);
        }
        if self.overflow_pending {
            frame.flags.insert(FrameFlags::QUEUE_OVERFLOW);
        }

        match self.frame_tx.try_send(frame) {
            Ok(()) => {
                self.overflow_pending = false;
                CaptureStep::Sent
            }
            Err(TrySendError::Full(_)) => {
                self.frame_dropped(seq, "frame queue full");
                CaptureStep::Dropped
            }
            Err(TrySendError::Disconnected(_)) => CaptureStep::Closed,
        }
    }

    /// Loops until `running` clears, the source ends or the consumer goes away.
    pub fn run(mut self, running: &AtomicBool) {
        if let Err(e) = self.source.start() {
            warn!(source = %self.source.name(), error = %e, "capture source failed to start");
            return;
        }
        info!(source = %self.source.name(), "capture started");

        while running.load(Ordering::SeqCst) {
            match self.step() {
                CaptureStep::Sent | CaptureStep::Dropped => {}
                CaptureStep::ReadFailed => {
                    // Skip the period rather than spin on a failing device.
                    thread::sleep(Duration::from_micros(FRAME_PERIOD_US));
                }
                CaptureStep::Exhausted => {
                    info!(frames = self.next_seq, "capture source exhausted");
                    break;
                }
                CaptureStep::Closed => {
                    debug!("frame queue closed, capture stopping");
                    break;
                }
            }
        }

        if let Err(e) = self.source.stop() {
            warn!(error = %e, "failed to stop capture source");
        }
        // Dropping the sender closes the frame queue once it drains.
    }

    fn read_failed(&mut self, message: &str) {
        Telemetry::incr(&self.telemetry.capture_errors);
        self.error_streak += 1;
        if self.error_streak == 1 || self.error_streak % ERROR_LOG_EVERY == 0 {
            warn!(streak = self.error_streak, "capture read failed: {message}");
        }
    }

    fn frame_dropped(&mut self, seq: u32, reason: &str) {
        Telemetry::incr(&self.telemetry.frames_dropped);
        if !self.overflow_pending {
            debug!(seq, "{reason}, dropping frame");
        }
        self.overflow_pending = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::source::MockSampleSource;
    use crate::pipeline::clock::MockClock;
    use crate::pipeline::queue::{QueueReceiver, bounded_queue};
    use std::time::Instant;

    fn stage(
        source: MockSampleSource,
        depth: usize,
        pool_size: usize,
    ) -> (CaptureStage, QueueReceiver<Frame>, Arc<Telemetry>) {
        let (tx, rx) = bounded_queue(depth);
        let telemetry = Telemetry::new();
        let stage = CaptureStage::new(
            Box::new(source),
            tx,
            BufferPool::new(pool_size),
            telemetry.clone(),
            DeviceClock::new(Arc::new(MockClock::new())),
        );
        (stage, rx, telemetry)
    }

    #[test]
    fn test_narrows_and_stamps_frames() {
        let mut samples = vec![0i16; FRAME_SAMPLES];
        samples[0] = 1000;
        samples[1] = -1234;
        let (mut stage, rx, telemetry) = stage(MockSampleSource::new().with_frame(samples), 4, 8);

        assert_eq!(stage.step(), CaptureStep::Sent);
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.seq, 0);
        assert_eq!(frame.raw[0], 1000);
        assert_eq!(frame.raw[1], -1234);
        assert_eq!(frame.peak, 1234);
        assert!(frame.flags.is_empty());
        assert_eq!(telemetry.snapshot().frames_captured, 1);
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let (mut stage, rx, _) = stage(MockSampleSource::new().with_silence(3), 4, 8);
        for _ in 0..3 {
            stage.step();
        }
        let seqs: Vec<u32> = std::iter::from_fn(|| rx.try_recv()).map(|f| f.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_full_queue_drops_without_waiting() {
        let (mut stage, rx, telemetry) =
            stage(MockSampleSource::new().with_silence(10).repeating(), 2, 16);
        assert_eq!(stage.step(), CaptureStep::Sent);
        assert_eq!(stage.step(), CaptureStep::Sent);

        let start = Instant::now();
        for _ in 0..5 {
            assert_eq!(stage.step(), CaptureStep::Dropped);
        }
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(telemetry.snapshot().frames_dropped, 5);

        // The next frame that gets through records the overflow.
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();
        assert_eq!(stage.step(), CaptureStep::Sent);
        let frame = rx.try_recv().unwrap();
        assert!(frame.flags.contains(FrameFlags::QUEUE_OVERFLOW));
        assert_eq!(frame.seq, 7);

        assert_eq!(stage.step(), CaptureStep::Sent);
        assert!(rx.try_recv().unwrap().flags.is_empty());
    }

    #[test]
    fn test_pool_exhaustion_drops_frame() {
        let (mut stage, _rx, telemetry) =
            stage(MockSampleSource::new().with_silence(3), 4, 1);
        assert_eq!(stage.step(), CaptureStep::Sent);
        assert_eq!(stage.step(), CaptureStep::Dropped);
        let snap = telemetry.snapshot();
        assert_eq!(snap.pool_exhausted, 1);
        assert_eq!(snap.frames_dropped, 1);
    }

    #[test]
    fn test_read_failure_skips_period() {
        let source = MockSampleSource::new()
            .with_read_failure("dma timeout")
            .with_short_read(100)
            .with_silence(1);
        let (mut stage, rx, telemetry) = stage(source, 4, 8);
        assert_eq!(stage.step(), CaptureStep::ReadFailed);
        assert_eq!(stage.step(), CaptureStep::ReadFailed);
        assert_eq!(stage.step(), CaptureStep::Sent);
        assert_eq!(telemetry.snapshot().capture_errors, 2);
        // Failed periods do not consume sequence numbers.
        assert_eq!(rx.try_recv().unwrap().seq, 0);
    }

    #[test]
    fn test_high_noise_flag() {
        let (mut stage, rx, telemetry) =
            stage(MockSampleSource::new().with_frame(vec![i16::MIN; 4]), 4, 8);
        stage.step();
        let frame = rx.try_recv().unwrap();
        assert!(frame.flags.contains(FrameFlags::HIGH_NOISE));
        assert_eq!(frame.peak, 32768u32 as u16);
        assert_eq!(telemetry.snapshot().peak_amplitude, 32768u32 as u16);
    }

    #[test]
    fn test_finite_source_exhausts() {
        let (mut stage, _rx, _) = stage(MockSampleSource::new().with_silence(1), 4, 8);
        assert_eq!(stage.step(), CaptureStep::Sent);
        assert_eq!(stage.step(), CaptureStep::Exhausted);
    }

    #[test]
    fn test_run_closes_queue_on_exhaustion() {
        let (stage, rx, _) = stage(MockSampleSource::new().with_silence(3), 4, 8);
        let running = AtomicBool::new(true);
        stage.run(&running);
        let frames: Vec<Frame> = std::iter::from_fn(|| rx.recv()).collect();
        assert_eq!(frames.len(), 3);
    }
}
