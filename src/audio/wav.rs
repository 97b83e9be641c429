//! WAV file sample source for replaying recordings through the pipeline.

use crate::audio::source::{SampleSource, WORD_BYTES};
use crate::defaults::{FRAME_PERIOD_US, SAMPLE_RATE};
use crate::error::{Result, StreamError};
use std::io::Read;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

/// Source that reads a whole WAV file into memory and hands it out frame by
/// frame as MSB-aligned 32-bit words. Any channel count is mixed to mono and
/// any rate is resampled to the pipeline rate.
pub struct WavSampleSource {
    words: Vec<i32>,
    position: usize,
    paced: bool,
    next_due: Option<Instant>,
    label: String,
}

impl WavSampleSource {
    /// Open a WAV file from disk.
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| StreamError::AudioCapture {
            message: format!("Failed to open {}: {}", path.display(), e),
        })?;
        let mut source = Self::from_reader(Box::new(std::io::BufReader::new(file)))?;
        source.label = format!("wav {}", path.display());
        Ok(source)
    }

    /// Create from any reader (for testing/flexibility).
    pub fn from_reader(reader: Box<dyn Read + Send>) -> Result<Self> {
        let mut wav_reader =
            hound::WavReader::new(reader).map_err(|e| StreamError::AudioCapture {
                message: format!("Failed to parse WAV file: {}", e),
            })?;

        let spec = wav_reader.spec();
        let read_err = |e: hound::Error| StreamError::AudioCapture {
            message: format!("Failed to read WAV samples: {}", e),
        };

        // Everything becomes MSB-aligned i32 before mixing.
        let raw: Vec<i32> = match spec.sample_format {
            hound::SampleFormat::Int => {
                let shift = 32u32.saturating_sub(u32::from(spec.bits_per_sample));
                wav_reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v << shift))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(read_err)?
            }
            hound::SampleFormat::Float => wav_reader
                .samples::<f32>()
                .map(|s| s.map(|v| (f64::from(v.clamp(-1.0, 1.0)) * f64::from(i32::MAX)) as i32))
                .collect::<std::result::Result<_, _>>()
                .map_err(read_err)?,
        };

        let channels = usize::from(spec.channels.max(1));
        let mono: Vec<i32> = if channels == 1 {
            raw
        } else {
            raw.chunks_exact(channels)
                .map(|frame| {
                    let sum: i64 = frame.iter().map(|&s| i64::from(s)).sum();
                    (sum / channels as i64) as i32
                })
                .collect()
        };

        let words = resample(&mono, spec.sample_rate, SAMPLE_RATE);

        Ok(Self {
            words,
            position: 0,
            paced: false,
            next_due: None,
            label: "wav".to_string(),
        })
    }

    /// Deliver one frame per capture period instead of as fast as possible.
    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    /// Samples remaining to be read.
    pub fn remaining(&self) -> usize {
        self.words.len().saturating_sub(self.position)
    }

    fn wait_for_period(&mut self, timeout: Duration) -> bool {
        let period = Duration::from_micros(FRAME_PERIOD_US);
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                thread::sleep(timeout);
                return false;
            }
            thread::sleep(wait);
        }
        let base = if Instant::now() > due + period { Instant::now() } else { due };
        self.next_due = Some(base + period);
        true
    }
}

impl SampleSource for WavSampleSource {
    fn start(&mut self) -> Result<()> {
        self.next_due = None;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [i32], timeout: Duration) -> Result<usize> {
        if self.position >= self.words.len() {
            return Ok(0);
        }
        if self.paced && !self.wait_for_period(timeout) {
            return Err(StreamError::AudioCapture {
                message: "read timed out".to_string(),
            });
        }

        let end = (self.position + buf.len()).min(self.words.len());
        let chunk = &self.words[self.position..end];
        buf[..chunk.len()].copy_from_slice(chunk);
        // The final frame is zero-padded to full length.
        buf[chunk.len()..].fill(0);
        self.position = end;
        Ok(buf.len() * WORD_BYTES)
    }

    fn is_finite(&self) -> bool {
        true
    }

    fn name(&self) -> String {
        self.label.clone()
    }
}

/// Simple linear interpolation resampling.
pub fn resample(samples: &[i32], from_rate: u32, to_rate: u32) -> Vec<i32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[source_idx]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as i32
            }
        })
        .collect()
}
