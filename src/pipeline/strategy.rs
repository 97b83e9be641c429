//! Pluggable per-frame processing strategies.
//!
//! A strategy turns one frame of raw samples into clean samples plus a voice
//! activity probability. `process_frame` must never block; a negative return
//! value signals failure for that frame only.

use crate::config::StrategyConfig;
use crate::error::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Returned by `process_frame` when the output is unusable.
pub const VAD_FAILURE: f32 = -1.0;

/// Which strategy the pipeline should try first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Passthrough,
    Scaled,
    Model,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Passthrough => "passthrough",
            StrategyKind::Scaled => "scaled",
            StrategyKind::Model => "model",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "passthrough" | "pass" | "none" => Ok(StrategyKind::Passthrough),
            "scaled" | "scaled_passthrough" => Ok(StrategyKind::Scaled),
            "model" => Ok(StrategyKind::Model),
            other => Err(StreamError::ConfigInvalidValue {
                key: "strategy.kind".to_string(),
                message: format!("unknown strategy '{other}' (expected passthrough, scaled or model)"),
            }),
        }
    }
}

/// Transforms one frame of samples.
pub trait ProcessingStrategy: Send {
    /// Identifier announced in the connection handshake.
    fn name(&self) -> &'static str;

    /// Prepares the strategy. A failure here is recovered by substitution.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Writes `output` from `input` and returns the VAD probability in [0, 1],
    /// or a negative value on failure. Both slices have the frame length.
    fn process_frame(&mut self, input: &[i16], output: &mut [i16]) -> f32;
}

/// Copies input to output unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl ProcessingStrategy for PassThrough {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn process_frame(&mut self, input: &[i16], output: &mut [i16]) -> f32 {
        if input.len() != output.len() {
            return VAD_FAILURE;
        }
        output.copy_from_slice(input);
        1.0
    }
}

/// Copies input to output multiplied by a fixed factor, clamped to 16 bits.
#[derive(Debug, Clone, Copy)]
pub struct ScaledPassThrough {
    scale: f32,
}

impl ScaledPassThrough {
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    fn apply(&self, sample: i16) -> i16 {
        // Float-to-int `as` truncates toward zero and saturates.
        (f32::from(sample) * self.scale).clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
    }
}

impl ProcessingStrategy for ScaledPassThrough {
    fn name(&self) -> &'static str {
        "scaled"
    }

    fn init(&mut self) -> Result<()> {
        if !self.scale.is_finite() || self.scale <= 0.0 || self.scale > 1.0 {
            return Err(StreamError::StrategyInit {
                strategy: self.name().to_string(),
                message: format!("scale {} outside (0, 1]", self.scale),
            });
        }
        Ok(())
    }

    fn process_frame(&mut self, input: &[i16], output: &mut [i16]) -> f32 {
        if input.len() != output.len() {
            return VAD_FAILURE;
        }
        for (out, &sample) in output.iter_mut().zip(input) {
            *out = self.apply(sample);
        }
        1.0
    }
}

/// Model-backed strategy.
///
/// Audio passes through unchanged. Voice activity comes from an RMS energy
/// detector with a hangover counter, so short pauses inside speech are not
/// reported as silence. `init` requires a readable, non-empty model file.
#[derive(Debug, Clone)]
pub struct ModelStrategy {
    model_path: Option<PathBuf>,
    /// Normalized RMS at which a frame counts as speech.
    threshold: f32,
    hangover_frames: u32,
    hangover_counter: u32,
    model_bytes: u64,
}

impl ModelStrategy {
    pub fn new(model_path: Option<PathBuf>) -> Self {
        Self {
            model_path,
            threshold: 0.02,
            hangover_frames: 8,
            hangover_counter: 0,
            model_bytes: 0,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_hangover(mut self, frames: u32) -> Self {
        self.hangover_frames = frames;
        self
    }

    fn init_error(&self, message: impl Into<String>) -> StreamError {
        StreamError::StrategyInit {
            strategy: self.name().to_string(),
            message: message.into(),
        }
    }

    fn rms(samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
        ((sum_sq / samples.len() as f64).sqrt() / 32768.0) as f32
    }

    fn classify(&mut self, rms: f32) -> f32 {
        if rms >= self.threshold {
            self.hangover_counter = self.hangover_frames;
            1.0
        } else if self.hangover_counter > 0 {
            self.hangover_counter -= 1;
            1.0
        } else if self.threshold > 0.0 {
            (rms / self.threshold).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

impl ProcessingStrategy for ModelStrategy {
    fn name(&self) -> &'static str {
        "model"
    }

    fn init(&mut self) -> Result<()> {
        let path = self
            .model_path
            .clone()
            .ok_or_else(|| self.init_error("no model path configured"))?;
        let meta = std::fs::metadata(&path)
            .map_err(|e| self.init_error(format!("{}: {e}", path.display())))?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(self.init_error(format!("{} is not a usable model file", path.display())));
        }
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(self.init_error(format!("invalid VAD threshold {}", self.threshold)));
        }
        self.model_bytes = meta.len();
        self.hangover_counter = 0;
        debug!(path = %path.display(), bytes = self.model_bytes, "model loaded");
        Ok(())
    }

    fn process_frame(&mut self, input: &[i16], output: &mut [i16]) -> f32 {
        if input.len() != output.len() || self.model_bytes == 0 {
            return VAD_FAILURE;
        }
        output.copy_from_slice(input);
        let rms = Self::rms(input);
        self.classify(rms)
    }
}

/// Builds the configured strategy without initialising it.
pub fn build_strategy(config: &StrategyConfig) -> Box<dyn ProcessingStrategy> {
    match config.kind {
        StrategyKind::Passthrough => Box::new(PassThrough),
        StrategyKind::Scaled => Box::new(ScaledPassThrough::new(config.scale)),
        StrategyKind::Model => Box::new(
            ModelStrategy::new(config.model_path.clone())
                .with_threshold(config.vad_threshold)
                .with_hangover(config.hangover_frames),
        ),
    }
}

/// Initialises `strategy`, substituting a known-good default on failure.
///
/// A failed model falls back to `ScaledPassThrough(fallback_scale)` to keep
/// headroom; anything else falls back to `PassThrough`. The stream never
/// halts because of a strategy.
pub fn init_with_fallback(
    mut strategy: Box<dyn ProcessingStrategy>,
    fallback_scale: f32,
) -> Box<dyn ProcessingStrategy> {
    let err = match strategy.init() {
        Ok(()) => {
            info!(strategy = strategy.name(), "processing strategy ready");
            return strategy;
        }
        Err(e) => e,
    };

    let failed = strategy.name();
    let mut substitute: Box<dyn ProcessingStrategy> = if failed == "model" {
        Box::new(ScaledPassThrough::new(fallback_scale))
    } else {
        Box::new(PassThrough)
    };
    if substitute.init().is_err() {
        substitute = Box::new(PassThrough);
    }
    warn!(
        failed,
        substitute = substitute.name(),
        error = %err,
        "strategy init failed, using fallback"
    );
    substitute
}
