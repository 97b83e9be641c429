//! Data types carried between pipeline stages.

use crate::defaults::{BATCH_MAGIC, FRAMES_PER_BATCH, PROTOCOL_VERSION};
use crate::pipeline::pool::PooledBuffer;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Status bits attached to a frame, and OR-ed together into a batch header.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const NONE: Self = Self(0);
    /// One or more frames were dropped at the frame queue before this one.
    pub const QUEUE_OVERFLOW: Self = Self(0x01);
    /// Older items were evicted from an output queue to make room for this one.
    pub const DISCONTINUITY: Self = Self(0x02);
    /// Peak amplitude reached the clipping threshold.
    pub const HIGH_NOISE: Self = Self(0x04);
    /// Processing took longer than one capture period.
    pub const OVER_BUDGET: Self = Self(0x08);
    /// The strategy reported failure; clean samples are a copy of raw.
    pub const STRATEGY_FAILED: Self = Self(0x10);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for FrameFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for FrameFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for FrameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(FrameFlags, &str); 5] = [
            (FrameFlags::QUEUE_OVERFLOW, "QUEUE_OVERFLOW"),
            (FrameFlags::DISCONTINUITY, "DISCONTINUITY"),
            (FrameFlags::HIGH_NOISE, "HIGH_NOISE"),
            (FrameFlags::OVER_BUDGET, "OVER_BUDGET"),
            (FrameFlags::STRATEGY_FAILED, "STRATEGY_FAILED"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "FrameFlags(NONE)")
        } else {
            write!(f, "FrameFlags({})", set.join(" | "))
        }
    }
}

/// Items that can record a gap caused by queue eviction.
pub trait MarkDiscontinuity {
    fn mark_discontinuity(&mut self);
}

/// One capture period of audio plus metadata.
#[derive(Debug)]
pub struct Frame {
    /// Monotonic per-stream sequence number.
    pub seq: u32,
    /// Device-monotonic capture time in milliseconds.
    pub captured_at_ms: u32,
    /// Raw samples narrowed to 16 bits.
    pub raw: PooledBuffer,
    /// Processed samples, filled in by the processing stage.
    pub clean: Option<PooledBuffer>,
    /// Voice activity probability in [0, 1].
    pub vad: f32,
    /// Normalized RMS of the raw samples in [0, 1].
    pub rms: f32,
    /// Peak absolute raw amplitude.
    pub peak: u16,
    pub flags: FrameFlags,
}

impl Frame {
    /// Creates an unprocessed frame.
    pub fn new(seq: u32, captured_at_ms: u32, raw: PooledBuffer) -> Self {
        Self {
            seq,
            captured_at_ms,
            raw,
            clean: None,
            vad: 0.0,
            rms: 0.0,
            peak: 0,
            flags: FrameFlags::NONE,
        }
    }

    /// Clean samples, falling back to raw for frames that were never processed.
    pub fn clean_or_raw(&self) -> &[i16] {
        self.clean.as_deref().unwrap_or(&self.raw[..])
    }
}

/// Fixed 16-byte batch header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHeader {
    pub magic: u32,
    pub version: u8,
    /// Union of the flags of every frame in the batch, plus eviction marks.
    pub flags: FrameFlags,
    pub batch_seq: u32,
    pub timestamp_ms: u32,
}

impl BatchHeader {
    /// A sealed header with the current magic and version.
    pub fn sealed(batch_seq: u32, timestamp_ms: u32, flags: FrameFlags) -> Self {
        Self {
            magic: BATCH_MAGIC,
            version: PROTOCOL_VERSION,
            flags,
            batch_seq,
            timestamp_ms,
        }
    }
}

/// A sealed batch of exactly `FRAMES_PER_BATCH` frames.
///
/// Only the batch assembler constructs these, so a `Batch` is always complete.
#[derive(Debug)]
pub struct Batch {
    header: BatchHeader,
    frames: Vec<Frame>,
}

impl Batch {
    pub(crate) fn sealed(header: BatchHeader, frames: Vec<Frame>) -> Self {
        debug_assert_eq!(frames.len(), FRAMES_PER_BATCH);
        Self { header, frames }
    }

    pub fn header(&self) -> &BatchHeader {
        &self.header
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn seq(&self) -> u32 {
        self.header.batch_seq
    }
}

impl MarkDiscontinuity for Batch {
    fn mark_discontinuity(&mut self) {
        self.header.flags.insert(FrameFlags::DISCONTINUITY);
    }
}

/// Processed samples headed for the local playback sink.
#[derive(Debug)]
pub struct PlaybackFrame {
    pub seq: u32,
    pub samples: PooledBuffer,
    pub flags: FrameFlags,
}

impl MarkDiscontinuity for PlaybackFrame {
    fn mark_discontinuity(&mut self) {
        self.flags.insert(FrameFlags::DISCONTINUITY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_insert_and_contains() {
        let mut flags = FrameFlags::NONE;
        assert!(flags.is_empty());
        flags.insert(FrameFlags::QUEUE_OVERFLOW);
        flags |= FrameFlags::HIGH_NOISE;
        assert!(flags.contains(FrameFlags::QUEUE_OVERFLOW));
        assert!(flags.contains(FrameFlags::HIGH_NOISE));
        assert!(!flags.contains(FrameFlags::DISCONTINUITY));
        assert_eq!(flags.bits(), 0x05);
    }

    #[test]
    fn test_flags_debug_lists_names() {
        let flags = FrameFlags::QUEUE_OVERFLOW | FrameFlags::OVER_BUDGET;
        assert_eq!(format!("{flags:?}"), "FrameFlags(QUEUE_OVERFLOW | OVER_BUDGET)");
        assert_eq!(format!("{:?}", FrameFlags::NONE), "FrameFlags(NONE)");
    }

    #[test]
    fn test_frame_creation() {
        let frame = Frame::new(7, 1234, PooledBuffer::detached(&[5, 6]));
        assert_eq!(frame.seq, 7);
        assert_eq!(frame.captured_at_ms, 1234);
        assert!(frame.clean.is_none());
        assert_eq!(&frame.clean_or_raw()[..2], &[5, 6]);
        assert!(frame.flags.is_empty());
    }

    #[test]
    fn test_sealed_header_uses_protocol_constants() {
        let header = BatchHeader::sealed(3, 99, FrameFlags::NONE);
        assert_eq!(header.magic, BATCH_MAGIC);
        assert_eq!(header.version, PROTOCOL_VERSION);
        assert_eq!(header.batch_seq, 3);
        assert_eq!(header.timestamp_ms, 99);
    }

    #[test]
    fn test_mark_discontinuity_on_batch() {
        let frames = (0..FRAMES_PER_BATCH as u32)
            .map(|i| Frame::new(i, 0, PooledBuffer::detached(&[])))
            .collect();
        let mut batch = Batch::sealed(BatchHeader::sealed(0, 0, FrameFlags::NONE), frames);
        batch.mark_discontinuity();
        assert!(batch.header().flags.contains(FrameFlags::DISCONTINUITY));
    }

    #[test]
    fn test_mark_discontinuity_on_playback_frame() {
        let mut frame = PlaybackFrame {
            seq: 1,
            samples: PooledBuffer::detached(&[]),
            flags: FrameFlags::NONE,
        };
        frame.mark_discontinuity();
        assert!(frame.flags.contains(FrameFlags::DISCONTINUITY));
    }
}
