//! Local playback branch: drains the playback queue into a sink.

use crate::defaults::SAMPLE_RATE;
use crate::error::{Result, StreamError};
use crate::pipeline::error::StationError;
use crate::pipeline::station::Station;
use crate::pipeline::types::{FrameFlags, PlaybackFrame};
use crate::telemetry::Telemetry;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Destination for processed audio on the device side.
pub trait PlaybackSink: Send + 'static {
    /// Writes one frame of samples.
    fn write(&mut self, samples: &[i16]) -> Result<()>;

    /// Flushes and closes the sink.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// Discards everything. Keeps the branch running for measurement.
#[derive(Debug, Default)]
pub struct NullSink {
    samples: u64,
}

impl NullSink {
    pub fn samples_written(&self) -> u64 {
        self.samples
    }
}

impl PlaybackSink for NullSink {
    fn write(&mut self, samples: &[i16]) -> Result<()> {
        self.samples += samples.len() as u64;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

/// Records processed audio to a 16-bit mono WAV file.
pub struct WavPlaybackSink {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
}

impl WavPlaybackSink {
    pub fn create(path: &Path) -> Result<Self> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, spec).map_err(|e| StreamError::Other(
            format!("Failed to create {}: {}", path.display(), e),
        ))?;
        Ok(Self {
            writer: Some(writer),
        })
    }
}

impl PlaybackSink for WavPlaybackSink {
    fn write(&mut self, samples: &[i16]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| StreamError::Other("playback file already finished".to_string()))?;
        let mut frame_writer = writer.get_i16_writer(samples.len() as u32);
        for &s in samples {
            frame_writer.write_sample(s);
        }
        frame_writer
            .flush()
            .map_err(|e| StreamError::Other(format!("Failed to write playback file: {}", e)))
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer
                .finalize()
                .map_err(|e| StreamError::Other(format!("Failed to finalize playback file: {}", e)))?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "wav"
    }
}

/// Terminal station writing playback frames to a sink.
pub struct PlaybackStation {
    sink: Box<dyn PlaybackSink>,
    telemetry: Arc<Telemetry>,
    gaps: u64,
}

impl PlaybackStation {
    pub fn new(sink: Box<dyn PlaybackSink>, telemetry: Arc<Telemetry>) -> Self {
        Self {
            sink,
            telemetry,
            gaps: 0,
        }
    }
}

impl Station for PlaybackStation {
    type Input = PlaybackFrame;
    type Output = ();

    fn process(&mut self, frame: PlaybackFrame) -> std::result::Result<Option<()>, StationError> {
        if frame.flags.contains(FrameFlags::DISCONTINUITY) {
            self.gaps += 1;
        }
        match self.sink.write(&frame.samples) {
            Ok(()) => {
                Telemetry::incr(&self.telemetry.playback_written);
                Ok(None)
            }
            Err(e) => {
                Telemetry::incr(&self.telemetry.playback_errors);
                Err(StationError::Recoverable(format!(
                    "{} sink, frame {}: {}",
                    self.sink.name(),
                    frame.seq,
                    e
                )))
            }
        }
    }

    fn name(&self) -> &'static str {
        "playback"
    }

    fn shutdown(&mut self) {
        match self.sink.finish() {
            Ok(()) => info!(sink = self.sink.name(), gaps = self.gaps, "playback finished"),
            Err(e) => debug!(sink = self.sink.name(), error = %e, "playback finish failed"),
        }
    }
}
