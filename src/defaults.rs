//! Default configuration constants for pcmlink.
//!
//! The frame geometry and wire constants are compile-time values shared by
//! every stage. Queue depths and timings are defaults for `Config`.

/// Capture sample rate in Hz.
pub const SAMPLE_RATE: u32 = 48_000;

/// Samples per frame: one 10 ms capture period at 48 kHz.
pub const FRAME_SAMPLES: usize = 480;

/// Frames sealed into one wire batch.
pub const FRAMES_PER_BATCH: usize = 4;

/// Duration of one capture period in microseconds.
pub const FRAME_PERIOD_US: u64 = (FRAME_SAMPLES as u64 * 1_000_000) / SAMPLE_RATE as u64;

/// Magic constant at the start of every batch header.
pub const BATCH_MAGIC: u32 = 0xABCD_1234;

/// Wire format version.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Encoding identifier announced in the handshake.
pub const ENCODING: &str = "pcm_s16le";

/// Batch size documented for receivers. The computed layout must match it.
pub const EXPECTED_BATCH_BYTES: usize = 7744;

/// Default frame queue depth (capture -> processing).
pub const FRAME_QUEUE_DEPTH: usize = 4;

/// Default output queue depth in batches (processing -> transmit).
pub const OUTPUT_QUEUE_DEPTH: usize = 8;

/// Default playback queue depth in frames (processing -> playback).
pub const PLAYBACK_QUEUE_DEPTH: usize = 8;

/// Largest queue depth accepted by configuration validation.
pub const MAX_QUEUE_DEPTH: usize = 64;

/// Spare pool buffers on top of the sum of all queue depths.
pub const POOL_MARGIN: usize = 4;

/// Default amplitude factor for the scaled pass-through strategy.
pub const DEFAULT_SCALE: f32 = 0.8;

/// Fixed delay between reconnect attempts.
pub const RECONNECT_INTERVAL_MS: u64 = 2000;

/// Upper bound on a single connect attempt.
pub const CONNECT_TIMEOUT_MS: u64 = 5000;

/// Hardware read timeout for one capture period.
pub const READ_TIMEOUT_MS: u64 = 100;

/// Default telemetry report interval. Zero disables the reporter.
pub const REPORT_INTERVAL_SECS: u64 = 5;

/// Default remote endpoint.
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_PATH: &str = "/esp32";

/// Peak amplitude at or above which a frame is flagged as high noise.
pub const HIGH_NOISE_PEAK: u16 = 32_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_period_is_ten_milliseconds() {
        assert_eq!(FRAME_PERIOD_US, 10_000);
    }

    #[test]
    fn default_pool_margin_is_nonzero() {
        const { assert!(POOL_MARGIN > 0) };
    }
}
