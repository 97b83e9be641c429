//! Live microphone capture using CPAL (Cross-Platform Audio Library).
//!
//! The cpal callback pushes into a lock-free ring buffer; `read` pops one
//! frame of words from the other end, waiting at most the read timeout.

use crate::audio::source::{SampleSource, WORD_BYTES};
use crate::defaults::SAMPLE_RATE;
use crate::error::{Result, StreamError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Half a second of audio at the pipeline rate.
const RING_CAPACITY: usize = SAMPLE_RATE as usize / 2;

/// Device name patterns that are never useful as a microphone.
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "Digital Output",
    "HDMI",
    "S/PDIF",
];

fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

/// List input devices, skipping outputs and multichannel pseudo-devices.
pub fn list_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host.input_devices().map_err(|e| StreamError::AudioCapture {
        message: format!("Failed to enumerate input devices: {}", e),
    })?;

    Ok(devices
        .filter_map(|device| device.name().ok())
        .filter(|name| !should_filter_device(name))
        .collect())
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched from the thread that owns the source,
/// behind the Mutex in `CpalSampleSource`.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Microphone source.
pub struct CpalSampleSource {
    device: cpal::Device,
    device_name: String,
    stream: Mutex<Option<SendableStream>>,
    consumer: Option<HeapCons<i32>>,
    overruns: Arc<AtomicU64>,
}

impl CpalSampleSource {
    /// Opens `device_name`, or the system default input when `None`.
    pub fn new(device_name: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => host
                .input_devices()
                .map_err(|e| StreamError::AudioCapture {
                    message: format!("Failed to enumerate devices: {}", e),
                })?
                .find(|dev| dev.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| StreamError::AudioDeviceNotFound {
                    device: name.to_string(),
                })?,
            None => host
                .default_input_device()
                .ok_or_else(|| StreamError::AudioDeviceNotFound {
                    device: "default".to_string(),
                })?,
        };
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

        Ok(Self {
            device,
            device_name,
            stream: Mutex::new(None),
            consumer: None,
            overruns: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Samples the callback could not store because the ring was full.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    fn build_stream(&self, mut producer: HeapProd<i32>) -> Result<cpal::Stream> {
        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };
        let overruns = Arc::clone(&self.overruns);
        let err_callback = |err| {
            warn!("audio stream error: {}", err);
        };

        // 16-bit devices are widened into the MSB-aligned word layout.
        if let Ok(default) = self.device.default_input_config()
            && default.sample_format() == cpal::SampleFormat::I16
        {
            return self
                .device
                .build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        for &s in data {
                            if producer.try_push(i32::from(s) << 16).is_err() {
                                overruns.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    },
                    err_callback,
                    None,
                )
                .map_err(|e| StreamError::AudioCapture {
                    message: format!("Failed to build i16 input stream: {}", e),
                });
        }

        self.device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for &s in data {
                        let word = (f64::from(s.clamp(-1.0, 1.0)) * f64::from(i32::MAX)) as i32;
                        if producer.try_push(word).is_err() {
                            overruns.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                },
                err_callback,
                None,
            )
            .map_err(|e| StreamError::AudioCapture {
                message: format!("Failed to build f32 input stream: {}", e),
            })
    }
}

impl SampleSource for CpalSampleSource {
    fn start(&mut self) -> Result<()> {
        if self.stream.lock().is_some() {
            return Ok(());
        }
        let (producer, consumer) = HeapRb::<i32>::new(RING_CAPACITY).split();
        let stream = self.build_stream(producer)?;
        stream.play().map_err(|e| StreamError::AudioCapture {
            message: format!("Failed to start audio stream: {}", e),
        })?;
        debug!(device = %self.device_name, "audio stream started");
        *self.stream.lock() = Some(SendableStream(stream));
        self.consumer = Some(consumer);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.lock().take() {
            stream.0.pause().map_err(|e| StreamError::AudioCapture {
                message: format!("Failed to stop audio stream: {}", e),
            })?;
        }
        self.consumer = None;
        Ok(())
    }

    fn read(&mut self, buf: &mut [i32], timeout: Duration) -> Result<usize> {
        let consumer = self.consumer.as_mut().ok_or(StreamError::AudioCapture {
            message: "audio stream not started".to_string(),
        })?;
        let deadline = Instant::now() + timeout;
        while consumer.occupied_len() < buf.len() {
            if Instant::now() >= deadline {
                // Partial data stays queued for the next period.
                return Ok(0);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let n = consumer.pop_slice(buf);
        Ok(n * WORD_BYTES)
    }

    fn name(&self) -> String {
        format!("cpal {}", self.device_name)
    }
}
