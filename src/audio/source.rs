use crate::defaults::{FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::{Result, StreamError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Bytes per hardware sample word.
pub const WORD_BYTES: usize = std::mem::size_of::<i32>();

/// Trait for sample sources feeding the capture stage.
///
/// Sources deliver signed 32-bit words carrying 24-bit audio MSB-aligned,
/// the way an I2S MEMS microphone does. The capture stage narrows them to
/// 16 bits with an arithmetic right shift.
pub trait SampleSource: Send {
    /// Start the underlying device or stream.
    fn start(&mut self) -> Result<()>;

    /// Stop the underlying device or stream.
    fn stop(&mut self) -> Result<()>;

    /// Fill `buf`, blocking at most `timeout`. Returns bytes written.
    ///
    /// A finite source returns `Ok(0)` once it has nothing left.
    fn read(&mut self, buf: &mut [i32], timeout: Duration) -> Result<usize>;

    /// Whether the source ends on its own (file, script) rather than running forever.
    fn is_finite(&self) -> bool {
        false
    }

    /// Short description for logs.
    fn name(&self) -> String;
}

/// Widens a 16-bit sample into the MSB-aligned 32-bit word a microphone delivers.
pub fn to_word(sample: i16) -> i32 {
    i32::from(sample) << 16
}

/// One scripted read result for `MockSampleSource`.
#[derive(Debug, Clone, PartialEq)]
pub enum MockRead {
    /// A frame of 16-bit samples, widened to words on read. Padded with zeros.
    Frame(Vec<i16>),
    /// The read fails with this message.
    Fail(String),
    /// The read returns only this many samples.
    Short(usize),
}

/// Scripted source for testing.
#[derive(Debug, Clone)]
pub struct MockSampleSource {
    script: VecDeque<MockRead>,
    replay: Vec<MockRead>,
    repeat: bool,
    pacing: Option<Duration>,
    should_fail_start: bool,
    is_started: bool,
    reads: Arc<AtomicUsize>,
}

impl MockSampleSource {
    /// An empty script. Reads return 0 bytes.
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            replay: Vec::new(),
            repeat: false,
            pacing: None,
            should_fail_start: false,
            is_started: false,
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Appends one frame to the script.
    pub fn with_frame(mut self, samples: Vec<i16>) -> Self {
        self.push(MockRead::Frame(samples));
        self
    }

    /// Appends `count` silent frames.
    pub fn with_silence(mut self, count: usize) -> Self {
        for _ in 0..count {
            self.push(MockRead::Frame(vec![0; FRAME_SAMPLES]));
        }
        self
    }

    /// Appends a failing read.
    pub fn with_read_failure(mut self, message: &str) -> Self {
        self.push(MockRead::Fail(message.to_string()));
        self
    }

    /// Appends a read that returns only `samples` samples.
    pub fn with_short_read(mut self, samples: usize) -> Self {
        self.push(MockRead::Short(samples));
        self
    }

    /// Configure the mock to fail on start.
    pub fn with_start_failure(mut self) -> Self {
        self.should_fail_start = true;
        self
    }

    /// Loops the script forever. The source is then not finite.
    pub fn repeating(mut self) -> Self {
        self.repeat = true;
        self
    }

    /// Sleeps this long in each read, like a hardware period.
    pub fn with_pacing(mut self, period: Duration) -> Self {
        self.pacing = Some(period);
        self
    }

    /// Shared counter of `read` calls.
    pub fn read_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.reads)
    }

    pub fn is_started(&self) -> bool {
        self.is_started
    }

    fn push(&mut self, step: MockRead) {
        self.replay.push(step.clone());
        self.script.push_back(step);
    }

    fn next_step(&mut self) -> Option<MockRead> {
        if self.script.is_empty() && self.repeat {
            self.script.extend(self.replay.iter().cloned());
        }
        self.script.pop_front()
    }
}

impl Default for MockSampleSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSource for MockSampleSource {
    fn start(&mut self) -> Result<()> {
        if self.should_fail_start {
            return Err(StreamError::AudioCapture {
                message: "mock start failure".to_string(),
            });
        }
        self.is_started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.is_started = false;
        Ok(())
    }

    fn read(&mut self, buf: &mut [i32], _timeout: Duration) -> Result<usize> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if let Some(period) = self.pacing {
            thread::sleep(period);
        }
        match self.next_step() {
            None => Ok(0),
            Some(MockRead::Frame(samples)) => {
                for (i, word) in buf.iter_mut().enumerate() {
                    *word = samples.get(i).copied().map(to_word).unwrap_or(0);
                }
                Ok(buf.len() * WORD_BYTES)
            }
            Some(MockRead::Short(n)) => {
                let n = n.min(buf.len());
                buf[..n].fill(0);
                Ok(n * WORD_BYTES)
            }
            Some(MockRead::Fail(message)) => Err(StreamError::AudioCapture { message }),
        }
    }

    fn is_finite(&self) -> bool {
        !self.repeat
    }

    fn name(&self) -> String {
        "mock".to_string()
    }
}

/// Synthetic sine source paced at the real sample rate.
#[derive(Debug, Clone)]
pub struct ToneSource {
    frequency: f32,
    amplitude: f32,
    phase: f32,
    next_due: Option<Instant>,
}

impl ToneSource {
    /// `amplitude` is a fraction of full scale.
    pub fn new(frequency: f32, amplitude: f32) -> Self {
        Self {
            frequency,
            amplitude: amplitude.clamp(0.0, 1.0),
            phase: 0.0,
            next_due: None,
        }
    }

    fn fill(&mut self, buf: &mut [i32]) {
        let step = std::f32::consts::TAU * self.frequency / SAMPLE_RATE as f32;
        // 24-bit full scale, MSB-aligned in the word.
        let full_scale = 8_388_607.0 * self.amplitude;
        for word in buf.iter_mut() {
            *word = ((self.phase.sin() * full_scale) as i32) << 8;
            self.phase = (self.phase + step) % std::f32::consts::TAU;
        }
    }
}

impl SampleSource for ToneSource {
    fn start(&mut self) -> Result<()> {
        self.next_due = Some(Instant::now());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.next_due = None;
        Ok(())
    }

    fn read(&mut self, buf: &mut [i32], timeout: Duration) -> Result<usize> {
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                thread::sleep(timeout);
                return Ok(0);
            }
            thread::sleep(wait);
        }
        let period =
            Duration::from_micros(buf.len() as u64 * 1_000_000 / u64::from(SAMPLE_RATE));
        // Fall back to now if we are more than one period late, instead of bursting.
        let base = if Instant::now() > due + period { Instant::now() } else { due };
        self.next_due = Some(base + period);
        self.fill(buf);
        Ok(buf.len() * WORD_BYTES)
    }

    fn name(&self) -> String {
        format!("tone {} Hz", self.frequency)
    }
}
