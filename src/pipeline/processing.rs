//! Processing station: runs the strategy on each frame, computes levels and
//! feeds the batch assembler. Optionally copies clean audio to playback.

use crate::defaults::FRAME_PERIOD_US;
use crate::pipeline::assembler::BatchAssembler;
use crate::pipeline::clock::Clock;
use crate::pipeline::error::StationError;
use crate::pipeline::output_queue::{EvictingQueue, PushOutcome};
use crate::pipeline::pool::BufferPool;
use crate::pipeline::station::Station;
use crate::pipeline::strategy::ProcessingStrategy;
use crate::pipeline::types::{Batch, Frame, FrameFlags, PlaybackFrame};
use crate::telemetry::Telemetry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Normalized RMS of 16-bit samples, in [0, 1].
pub fn normalized_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    ((sum_sq / samples.len() as f64).sqrt() / 32768.0).min(1.0) as f32
}

pub struct ProcessingStation {
    strategy: Box<dyn ProcessingStrategy>,
    assembler: BatchAssembler,
    pool: BufferPool,
    telemetry: Arc<Telemetry>,
    clock: Arc<dyn Clock>,
    frame_budget: Duration,
    playback: Option<EvictingQueue<PlaybackFrame>>,
}

impl ProcessingStation {
    pub fn new(
        strategy: Box<dyn ProcessingStrategy>,
        assembler: BatchAssembler,
        pool: BufferPool,
        telemetry: Arc<Telemetry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            strategy,
            assembler,
            pool,
            telemetry,
            clock,
            frame_budget: Duration::from_micros(FRAME_PERIOD_US),
            playback: None,
        }
    }

    /// Frames that take longer than this are flagged `OVER_BUDGET`.
    pub fn with_frame_budget(mut self, budget: Duration) -> Self {
        self.frame_budget = budget;
        self
    }

    /// Also send a copy of every clean frame to this queue.
    pub fn with_playback(mut self, queue: EvictingQueue<PlaybackFrame>) -> Self {
        self.playback = Some(queue);
        self
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    fn run_strategy(&mut self, frame: &mut Frame) -> Result<(), StationError> {
        let mut clean = self
            .pool
            .acquire()
            .ok_or_else(|| StationError::Recoverable(format!("no free buffer for frame {}", frame.seq)))?;

        let vad = self.strategy.process_frame(&frame.raw, &mut clean);
        if vad.is_nan() || vad < 0.0 {
            Telemetry::incr(&self.telemetry.strategy_failures);
            clean.copy_from_slice(&frame.raw);
            frame.vad = 0.0;
            frame.flags.insert(FrameFlags::STRATEGY_FAILED);
        } else {
            frame.vad = vad.min(1.0);
        }
        frame.clean = Some(clean);
        Ok(())
    }

    fn offer_playback(&self, frame: &Frame) {
        let Some(queue) = &self.playback else {
            return;
        };
        // Playback is best effort; a missing buffer just skips this frame.
        let Some(mut samples) = self.pool.acquire() else {
            return;
        };
        samples.copy_from_slice(frame.clean_or_raw());
        let outcome = queue.push(PlaybackFrame {
            seq: frame.seq,
            samples,
            flags: frame.flags,
        });
        if outcome == PushOutcome::Evicted {
            debug!(seq = frame.seq, "playback queue full, evicted oldest");
        }
    }
}

impl Station for ProcessingStation {
    type Input = Frame;
    type Output = Batch;

    fn process(&mut self, mut frame: Frame) -> Result<Option<Batch>, StationError> {
        let started = self.clock.now();

        self.run_strategy(&mut frame)?;
        frame.rms = normalized_rms(&frame.raw);

        if self.clock.now().saturating_duration_since(started) > self.frame_budget {
            Telemetry::incr(&self.telemetry.over_budget);
            frame.flags.insert(FrameFlags::OVER_BUDGET);
        }
        Telemetry::incr(&self.telemetry.frames_processed);

        self.offer_playback(&frame);

        let sealed = self.assembler.add_frame(frame);
        if let Some(batch) = &sealed {
            Telemetry::incr(&self.telemetry.batches_sealed);
            if !batch.header().flags.is_empty() {
                debug!(batch_seq = batch.seq(), flags = ?batch.header().flags, "sealed batch");
            }
        }
        Ok(sealed)
    }

    fn name(&self) -> &'static str {
        "process"
    }

    fn shutdown(&mut self) {
        let discarded = self.assembler.discard_partial();
        if discarded > 0 {
            warn!(frames = discarded, "discarding partial batch on shutdown");
        }
        if let Some(queue) = &self.playback {
            queue.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::{FRAME_SAMPLES, FRAMES_PER_BATCH};
    use crate::pipeline::clock::{DeviceClock, MockClock, SystemClock};
    use crate::pipeline::strategy::{PassThrough, ScaledPassThrough, VAD_FAILURE};

    struct FailingStrategy;

    impl ProcessingStrategy for FailingStrategy {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn process_frame(&mut self, _input: &[i16], _output: &mut [i16]) -> f32 {
            VAD_FAILURE
        }
    }

    /// Advances the mock clock while "processing", to simulate a slow model.
    struct SlowStrategy {
        clock: MockClock,
    }

    impl ProcessingStrategy for SlowStrategy {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn process_frame(&mut self, input: &[i16], output: &mut [i16]) -> f32 {
            self.clock.advance(Duration::from_millis(25));
            output.copy_from_slice(input);
            0.5
        }
    }

    fn station(strategy: Box<dyn ProcessingStrategy>, pool: &BufferPool) -> ProcessingStation {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        ProcessingStation::new(
            strategy,
            BatchAssembler::new(DeviceClock::new(clock.clone())),
            pool.clone(),
            Telemetry::new(),
            clock,
        )
    }

    fn frame(pool: &BufferPool, seq: u32, fill: i16) -> Frame {
        let mut raw = pool.acquire().unwrap();
        raw.fill(fill);
        Frame::new(seq, 0, raw)
    }

    #[test]
    fn test_normalized_rms() {
        assert_eq!(normalized_rms(&[]), 0.0);
        assert_eq!(normalized_rms(&[0; 8]), 0.0);
        let full = normalized_rms(&[i16::MIN; 8]);
        assert!((full - 1.0).abs() < 1e-6);
        let half = normalized_rms(&[16384, -16384]);
        assert!((half - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_emits_batch_every_frames_per_batch() {
        let pool = BufferPool::new(32);
        let mut station = station(Box::new(PassThrough), &pool);
        let mut batches = Vec::new();
        for seq in 0..(FRAMES_PER_BATCH as u32 * 2) {
            if let Some(batch) = station.process(frame(&pool, seq, 7)).unwrap() {
                batches.push(batch);
            }
        }
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].seq(), 0);
        assert_eq!(batches[1].seq(), 1);
        let f = &batches[0].frames()[0];
        assert_eq!(f.clean.as_deref(), Some(&f.raw[..]));
        assert_eq!(f.vad, 1.0);
    }

    #[test]
    fn test_scaled_strategy_output_in_clean() {
        let pool = BufferPool::new(16);
        let mut station = station(Box::new(ScaledPassThrough::new(0.5)), &pool);
        for seq in 0..FRAMES_PER_BATCH as u32 - 1 {
            station.process(frame(&pool, seq, 1000)).unwrap();
        }
        let batch = station.process(frame(&pool, 3, 1000)).unwrap().unwrap();
        let clean = batch.frames()[3].clean.as_deref().unwrap();
        assert!(clean.iter().all(|&s| s == 500));
        assert!(batch.frames()[3].raw.iter().all(|&s| s == 1000));
    }

    #[test]
    fn test_strategy_failure_copies_raw_and_flags() {
        let pool = BufferPool::new(16);
        let mut station = station(Box::new(FailingStrategy), &pool);
        let telemetry = station.telemetry.clone();
        for seq in 0..FRAMES_PER_BATCH as u32 - 1 {
            station.process(frame(&pool, seq, 42)).unwrap();
        }
        let batch = station.process(frame(&pool, 3, 42)).unwrap().unwrap();
        let f = &batch.frames()[0];
        assert_eq!(f.vad, 0.0);
        assert!(f.flags.contains(FrameFlags::STRATEGY_FAILED));
        assert!(f.clean.as_deref().unwrap().iter().all(|&s| s == 42));
        assert!(batch.header().flags.contains(FrameFlags::STRATEGY_FAILED));
        assert_eq!(telemetry.snapshot().strategy_failures, FRAMES_PER_BATCH as u64);
    }

    #[test]
    fn test_over_budget_is_flagged_not_aborted() {
        let pool = BufferPool::new(16);
        let mock = MockClock::new();
        let clock: Arc<dyn Clock> = Arc::new(mock.clone());
        let mut station = ProcessingStation::new(
            Box::new(SlowStrategy { clock: mock }),
            BatchAssembler::new(DeviceClock::new(clock.clone())),
            pool.clone(),
            Telemetry::new(),
            clock,
        );
        for seq in 0..FRAMES_PER_BATCH as u32 - 1 {
            station.process(frame(&pool, seq, 1)).unwrap();
        }
        let batch = station.process(frame(&pool, 3, 1)).unwrap().unwrap();
        assert!(batch.frames().iter().all(|f| f.flags.contains(FrameFlags::OVER_BUDGET)));
        assert_eq!(batch.frames()[0].vad, 0.5);
        assert_eq!(station.telemetry.snapshot().over_budget, FRAMES_PER_BATCH as u64);
    }

    #[test]
    fn test_missing_clean_buffer_is_recoverable() {
        let pool = BufferPool::new(1);
        let mut station = station(Box::new(PassThrough), &pool);
        let result = station.process(frame(&pool, 0, 0));
        assert!(matches!(result, Err(StationError::Recoverable(_))));
    }

    #[test]
    fn test_playback_copy_is_independent() {
        let pool = BufferPool::new(32);
        let playback = EvictingQueue::new(2);
        let mut station = station(Box::new(PassThrough), &pool).with_playback(playback.clone());
        for seq in 0..3 {
            station.process(frame(&pool, seq, seq as i16 + 1)).unwrap();
        }
        // Capacity 2: the first playback frame was evicted.
        assert_eq!(playback.evictions(), 1);
        let first = playback.try_recv().unwrap();
        assert_eq!(first.seq, 1);
        assert!(first.samples.iter().all(|&s| s == 2));
        let second = playback.try_recv().unwrap();
        assert!(second.flags.contains(FrameFlags::DISCONTINUITY));
        assert_eq!(second.samples.len(), FRAME_SAMPLES);
    }

    #[test]
    fn test_shutdown_closes_playback() {
        let pool = BufferPool::new(8);
        let playback = EvictingQueue::new(2);
        let mut station = station(Box::new(PassThrough), &pool).with_playback(playback.clone());
        station.process(frame(&pool, 0, 0)).unwrap();
        station.shutdown();
        assert!(playback.is_closed());
        assert_eq!(station.assembler.pending(), 0);
    }
}
