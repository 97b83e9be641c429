use crate::defaults::{
    CONNECT_TIMEOUT_MS, DEFAULT_HOST, DEFAULT_PATH, DEFAULT_PORT, DEFAULT_SCALE,
    FRAME_QUEUE_DEPTH, MAX_QUEUE_DEPTH, OUTPUT_QUEUE_DEPTH, PLAYBACK_QUEUE_DEPTH, POOL_MARGIN,
    READ_TIMEOUT_MS, RECONNECT_INTERVAL_MS, REPORT_INTERVAL_SECS,
};
use crate::error::{Result, StreamError};
use crate::pipeline::pool::PoolSizing;
use crate::pipeline::strategy::StrategyKind;
use crate::transport::DisconnectPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub pipeline: QueueConfig,
    pub strategy: StrategyConfig,
    pub transmit: TransmitConfig,
    pub playback: PlaybackConfig,
    pub telemetry: TelemetryConfig,
}

/// Where frames come from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Live capture device (requires the `cpal-audio` feature).
    Device,
    /// Synthetic sine tone.
    Tone,
    /// WAV file, resampled to the stream rate.
    Wav,
}

impl Default for SourceKind {
    fn default() -> Self {
        if cfg!(feature = "cpal-audio") {
            Self::Device
        } else {
            Self::Tone
        }
    }
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Tone => "tone",
            Self::Wav => "wav",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "device" => Ok(Self::Device),
            "tone" => Ok(Self::Tone),
            "wav" => Ok(Self::Wav),
            other => Err(StreamError::ConfigInvalidValue {
                key: "audio.source".to_string(),
                message: format!("unknown source '{other}', expected device, tone or wav"),
            }),
        }
    }
}

/// Audio capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub source: SourceKind,
    pub device: Option<String>,
    pub wav_path: Option<PathBuf>,
    /// Deliver WAV frames in real time rather than as fast as possible.
    pub paced: bool,
    pub tone_frequency: f32,
    pub tone_amplitude: f32,
    pub read_timeout_ms: u64,
}

/// Queue depths and buffer pool sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub frame_queue_depth: usize,
    pub output_queue_depth: usize,
    /// Explicit pool size. Computed from the queue depths when absent.
    pub pool_capacity: Option<usize>,
    pub pool_margin: usize,
}

/// Processing strategy configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StrategyConfig {
    pub kind: StrategyKind,
    /// Amplitude factor for `scaled`, and for the fallback after a model fails.
    pub scale: f32,
    pub model_path: Option<PathBuf>,
    pub vad_threshold: f32,
    pub hangover_frames: u32,
}

/// Network sender configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransmitConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub reconnect_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub disconnect_policy: DisconnectPolicy,
    /// Name announced in the handshake.
    pub device_name: String,
}

/// Local playback branch configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    pub enabled: bool,
    pub queue_depth: usize,
    /// Record processed audio here. Discarded when absent.
    pub wav_path: Option<PathBuf>,
}

/// Status reporting configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Seconds between status lines. Zero disables the reporter.
    pub report_interval_secs: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::default(),
            device: None,
            wav_path: None,
            paced: true,
            tone_frequency: 440.0,
            tone_amplitude: 0.5,
            read_timeout_ms: READ_TIMEOUT_MS,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            frame_queue_depth: FRAME_QUEUE_DEPTH,
            output_queue_depth: OUTPUT_QUEUE_DEPTH,
            pool_capacity: None,
            pool_margin: POOL_MARGIN,
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: StrategyKind::default(),
            scale: DEFAULT_SCALE,
            model_path: None,
            vad_threshold: 0.02,
            hangover_frames: 8,
        }
    }
}

impl Default for TransmitConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            reconnect_interval_ms: RECONNECT_INTERVAL_MS,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            disconnect_policy: DisconnectPolicy::default(),
            device_name: "pcmlink".to_string(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            queue_depth: PLAYBACK_QUEUE_DEPTH,
            wav_path: None,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: REPORT_INTERVAL_SECS,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only a missing file yields defaults; invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - PCMLINK_HOST → transmit.host
    /// - PCMLINK_PORT → transmit.port
    /// - PCMLINK_STRATEGY → strategy.kind
    /// - PCMLINK_AUDIO_DEVICE → audio.device
    ///
    /// Empty values are ignored; unparseable ones are logged and ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var("PCMLINK_HOST")
            && !host.is_empty()
        {
            self.transmit.host = host;
        }

        if let Ok(port) = std::env::var("PCMLINK_PORT")
            && !port.is_empty()
        {
            match port.parse() {
                Ok(port) => self.transmit.port = port,
                Err(_) => warn!(value = %port, "ignoring invalid PCMLINK_PORT"),
            }
        }

        if let Ok(kind) = std::env::var("PCMLINK_STRATEGY")
            && !kind.is_empty()
        {
            match kind.parse() {
                Ok(kind) => self.strategy.kind = kind,
                Err(e) => warn!(error = %e, "ignoring invalid PCMLINK_STRATEGY"),
            }
        }

        if let Ok(device) = std::env::var("PCMLINK_AUDIO_DEVICE")
            && !device.is_empty()
        {
            self.audio.device = Some(device);
        }

        self
    }

    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        check_depth("pipeline.frame_queue_depth", self.pipeline.frame_queue_depth)?;
        check_depth("pipeline.output_queue_depth", self.pipeline.output_queue_depth)?;
        if self.playback.enabled {
            check_depth("playback.queue_depth", self.playback.queue_depth)?;
        }

        let scale = self.strategy.scale;
        if !(scale > 0.0 && scale <= 1.0) {
            return Err(invalid("strategy.scale", format!("{scale} is outside (0, 1]")));
        }
        if self.transmit.host.trim().is_empty() {
            return Err(invalid("transmit.host", "must not be empty"));
        }
        if self.transmit.port == 0 {
            return Err(invalid("transmit.port", "must not be zero"));
        }
        if self.transmit.reconnect_interval_ms == 0 {
            return Err(invalid("transmit.reconnect_interval_ms", "must not be zero"));
        }
        if self.transmit.connect_timeout_ms == 0 {
            return Err(invalid("transmit.connect_timeout_ms", "must not be zero"));
        }
        if self.audio.source == SourceKind::Wav && self.audio.wav_path.is_none() {
            return Err(invalid("audio.wav_path", "required when audio.source = \"wav\""));
        }

        self.pool_sizing().resolve(self.pipeline.pool_capacity)?;
        Ok(())
    }

    /// Queue depths that determine the minimum buffer pool size.
    pub fn pool_sizing(&self) -> PoolSizing {
        PoolSizing {
            frame_queue_depth: self.pipeline.frame_queue_depth,
            output_queue_depth: self.pipeline.output_queue_depth,
            playback_queue_depth: if self.playback.enabled {
                self.playback.queue_depth
            } else {
                0
            },
            margin: self.pipeline.pool_margin,
        }
    }

    /// Effective configuration rendered as TOML.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/pcmlink/config.toml on Linux
    #[cfg(feature = "cli")]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pcmlink")
            .join("config.toml")
    }
}

fn invalid(key: &str, message: impl Into<String>) -> StreamError {
    StreamError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn check_depth(key: &str, depth: usize) -> Result<()> {
    if depth == 0 || depth > MAX_QUEUE_DEPTH {
        return Err(invalid(
            key,
            format!("{depth} is outside 1..={MAX_QUEUE_DEPTH}"),
        ));
    }
    Ok(())
}
