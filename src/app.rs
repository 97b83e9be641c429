//! Streaming application entry points.
//!
//! Builds the pipeline's collaborators from configuration and drives it until
//! the source runs dry, the duration elapses or the user interrupts.

use crate::audio::source::{SampleSource, ToneSource};
use crate::audio::wav::WavSampleSource;
use crate::cli::RunArgs;
use crate::config::{Config, PlaybackConfig, SourceKind};
use crate::defaults::{
    BATCH_MAGIC, FRAME_SAMPLES, FRAMES_PER_BATCH, PROTOCOL_VERSION, SAMPLE_RATE,
};
use crate::error::{Result, StreamError};
use crate::pipeline::orchestrator::{Pipeline, PipelineConfig, PipelineHandle};
use crate::pipeline::playback::{NullSink, PlaybackSink, WavPlaybackSink};
use crate::pipeline::strategy::build_strategy;
use crate::protocol::{BATCH_BYTES, BATCH_HEADER_BYTES, FRAME_RECORD_BYTES, validate_layout};
use crate::receiver;
use crate::telemetry::TelemetrySnapshot;
use crate::transport::WsTransport;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// How often the run loop checks whether a finite source has drained.
const FINISH_POLL: Duration = Duration::from_millis(100);

/// Applies command-line overrides on top of file and environment settings.
pub fn apply_overrides(config: &mut Config, args: &RunArgs) {
    if let Some(host) = &args.host {
        config.transmit.host = host.clone();
    }
    if let Some(port) = args.port {
        config.transmit.port = port;
    }
    if let Some(path) = &args.path {
        config.transmit.path = path.clone();
    }
    if let Some(kind) = args.strategy {
        config.strategy.kind = kind;
    }
    if let Some(policy) = args.policy {
        config.transmit.disconnect_policy = policy;
    }
    if let Some(device) = &args.device {
        config.audio.device = Some(device.clone());
    }
    if let Some(wav) = &args.wav {
        config.audio.wav_path = Some(wav.clone());
        config.audio.source = SourceKind::Wav;
    }
    // An explicit --source wins over the --wav implication.
    if let Some(source) = args.source {
        config.audio.source = source;
    }
    if let Some(out) = &args.playback {
        config.playback.enabled = true;
        config.playback.wav_path = Some(out.clone());
    }
}

/// Opens the configured sample source.
pub fn build_source(config: &Config) -> Result<Box<dyn SampleSource>> {
    let audio = &config.audio;
    match audio.source {
        SourceKind::Tone => Ok(Box::new(ToneSource::new(
            audio.tone_frequency,
            audio.tone_amplitude,
        ))),
        SourceKind::Wav => {
            let path = audio.wav_path.as_deref().ok_or_else(|| StreamError::ConfigInvalidValue {
                key: "audio.wav_path".to_string(),
                message: "required when audio.source = \"wav\"".to_string(),
            })?;
            let source = WavSampleSource::open(path)?.paced(audio.paced);
            info!(path = %path.display(), frames = source.remaining() / FRAME_SAMPLES, "streaming WAV file");
            Ok(Box::new(source))
        }
        SourceKind::Device => device_source(audio.device.as_deref()),
    }
}

#[cfg(feature = "cpal-audio")]
fn device_source(device: Option<&str>) -> Result<Box<dyn SampleSource>> {
    Ok(Box::new(crate::audio::capture::CpalSampleSource::new(device)?))
}

#[cfg(not(feature = "cpal-audio"))]
fn device_source(device: Option<&str>) -> Result<Box<dyn SampleSource>> {
    Err(StreamError::AudioDeviceNotFound {
        device: format!(
            "{} (built without the cpal-audio feature)",
            device.unwrap_or("default")
        ),
    })
}

/// Opens the playback sink, if the playback branch is enabled.
pub fn build_playback(config: &PlaybackConfig) -> Result<Option<Box<dyn PlaybackSink>>> {
    if !config.enabled {
        return Ok(None);
    }
    let sink: Box<dyn PlaybackSink> = match &config.wav_path {
        Some(path) => Box::new(WavPlaybackSink::create(path)?),
        None => Box::new(NullSink::default()),
    };
    Ok(Some(sink))
}

/// Starts the pipeline described by `config`.
pub fn start_pipeline(config: &Config) -> Result<PipelineHandle> {
    config.validate()?;

    let source = build_source(config)?;
    let strategy = build_strategy(&config.strategy);
    let transport = WsTransport::new()?;
    let playback = build_playback(&config.playback)?;

    info!(
        version = %crate::version_string(),
        endpoint = %config.transmit.host,
        port = config.transmit.port,
        source = %config.audio.source,
        strategy = %config.strategy.kind,
        policy = %config.transmit.disconnect_policy,
        "pcmlink starting"
    );

    Pipeline::new(PipelineConfig::from_config(config)).start(
        source,
        strategy,
        Box::new(transport),
        playback,
    )
}

/// Runs the streaming pipeline until the source drains, `duration` elapses
/// or Ctrl-C arrives. Returns the final counters.
pub async fn run_stream(config: Config, duration: Option<Duration>) -> Result<TelemetrySnapshot> {
    // The transport owns a runtime, which must not be dropped on an async
    // worker if startup fails part way.
    let handle = tokio::task::spawn_blocking(move || start_pipeline(&config))
        .await
        .map_err(|e| StreamError::Other(format!("pipeline startup task failed: {e}")))??;

    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut poll = tokio::time::interval(FINISH_POLL);
    let drained = loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                }
                info!("interrupted, stopping");
                break false;
            }
            _ = &mut deadline => {
                info!("duration elapsed, stopping");
                break false;
            }
            _ = poll.tick() => {
                if handle.is_finished() {
                    break true;
                }
            }
        }
    };

    let snapshot = tokio::task::spawn_blocking(move || {
        if drained { handle.wait() } else { handle.stop() }
    })
    .await
    .map_err(|e| StreamError::Other(format!("pipeline shutdown task failed: {e}")))?;

    Ok(snapshot)
}

/// Runs the reference receiver until Ctrl-C.
pub async fn run_listener(bind: &str) -> Result<()> {
    let listener = TcpListener::bind(bind).await.map_err(|e| StreamError::TransportConnect {
        endpoint: bind.to_string(),
        message: e.to_string(),
    })?;

    tokio::select! {
        result = receiver::serve(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("receiver stopped");
            Ok(())
        }
    }
}

/// Human-readable description of the batch layout, after checking it.
pub fn layout_report() -> Result<String> {
    validate_layout()?;

    let frame_ms = FRAME_SAMPLES as f64 * 1000.0 / f64::from(SAMPLE_RATE);
    let mut lines = vec![
        format!("sample rate      {SAMPLE_RATE} Hz"),
        format!("frame            {FRAME_SAMPLES} samples ({frame_ms} ms)"),
        format!("frames per batch {FRAMES_PER_BATCH}"),
        format!("magic            0x{BATCH_MAGIC:08X}"),
        format!("version          {PROTOCOL_VERSION}"),
        String::new(),
        "offset  size  field".to_string(),
    ];
    lines.extend(
        layout_fields()
            .into_iter()
            .map(|(offset, size, field)| format!("{offset:>6}  {size:>4}  {field}")),
    );
    lines.push(String::new());
    lines.push(format!(
        "header {BATCH_HEADER_BYTES} + {FRAMES_PER_BATCH} x record {FRAME_RECORD_BYTES} = {BATCH_BYTES} bytes"
    ));

    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out)
}

/// (offset, size, name) for every field of one batch.
fn layout_fields() -> Vec<(usize, usize, String)> {
    let mut fields = vec![
        (0, 4, "magic".to_string()),
        (4, 1, "version".to_string()),
        (5, 3, "reserved (flags, 0, 0)".to_string()),
        (8, 4, "batch_seq".to_string()),
        (12, 4, "timestamp_ms".to_string()),
    ];
    let pcm = FRAME_SAMPLES * 2;
    for i in 0..FRAMES_PER_BATCH {
        let base = BATCH_HEADER_BYTES + i * FRAME_RECORD_BYTES;
        fields.push((base, 4, format!("frame[{i}].frame_seq")));
        fields.push((base + 4, 4, format!("frame[{i}].vad_prob")));
        fields.push((base + 8, 4, format!("frame[{i}].rms_raw")));
        fields.push((base + 12, pcm, format!("frame[{i}].raw_pcm")));
        fields.push((base + 12 + pcm, pcm, format!("frame[{i}].clean_pcm")));
    }
    fields
}
