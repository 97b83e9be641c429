//! Groups processed frames into sealed, fixed-size batches.

use crate::defaults::FRAMES_PER_BATCH;
use crate::pipeline::clock::DeviceClock;
use crate::pipeline::types::{Batch, BatchHeader, Frame, FrameFlags};

/// Owned by the processing stage only.
///
/// Frames are appended in arrival order. When `FRAMES_PER_BATCH` frames are
/// held the batch is sealed: `batch_seq` is the number of batches sealed
/// before it, the timestamp is taken from the device clock, and the header
/// flags are the union of every frame's flags. Sealed batches are moved out,
/// so the assembler can never touch them again.
#[derive(Debug)]
pub struct BatchAssembler {
    frames: Vec<Frame>,
    flags: FrameFlags,
    next_seq: u32,
    clock: DeviceClock,
}

impl BatchAssembler {
    pub fn new(clock: DeviceClock) -> Self {
        Self {
            frames: Vec::with_capacity(FRAMES_PER_BATCH),
            flags: FrameFlags::NONE,
            next_seq: 0,
            clock,
        }
    }

    /// Adds a frame; returns the sealed batch when this frame completes one.
    pub fn add_frame(&mut self, frame: Frame) -> Option<Batch> {
        self.flags |= frame.flags;
        self.frames.push(frame);
        if self.frames.len() < FRAMES_PER_BATCH {
            return None;
        }

        let frames = std::mem::replace(&mut self.frames, Vec::with_capacity(FRAMES_PER_BATCH));
        let flags = std::mem::take(&mut self.flags);
        let header = BatchHeader::sealed(self.next_seq, self.clock.millis(), flags);
        self.next_seq = self.next_seq.wrapping_add(1);
        Some(Batch::sealed(header, frames))
    }

    /// Frames waiting for the current batch to fill.
    pub fn pending(&self) -> usize {
        self.frames.len()
    }

    /// Sequence number the next sealed batch will carry.
    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    /// Drops any partially filled batch. Returns how many frames were discarded.
    pub fn discard_partial(&mut self) -> usize {
        let n = self.frames.len();
        self.frames.clear();
        self.flags = FrameFlags::NONE;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::clock::MockClock;
    use crate::pipeline::pool::PooledBuffer;
    use std::sync::Arc;
    use std::time::Duration;

    fn frame(seq: u32) -> Frame {
        Frame::new(seq, seq * 10, PooledBuffer::detached(&[seq as i16]))
    }

    fn assembler() -> (BatchAssembler, MockClock) {
        let mock = MockClock::new();
        (
            BatchAssembler::new(DeviceClock::new(Arc::new(mock.clone()))),
            mock,
        )
    }

    #[test]
    fn test_partial_batch_is_not_exposed() {
        let (mut asm, _) = assembler();
        for seq in 0..FRAMES_PER_BATCH as u32 - 1 {
            assert!(asm.add_frame(frame(seq)).is_none());
        }
        assert_eq!(asm.pending(), FRAMES_PER_BATCH - 1);
    }

    #[test]
    fn test_seals_exactly_frames_per_batch() {
        let (mut asm, _) = assembler();
        let mut sealed = Vec::new();
        for seq in 0..(FRAMES_PER_BATCH as u32 * 3) {
            if let Some(batch) = asm.add_frame(frame(seq)) {
                sealed.push(batch);
            }
        }
        assert_eq!(sealed.len(), 3);
        for batch in &sealed {
            assert_eq!(batch.frames().len(), FRAMES_PER_BATCH);
        }
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn test_batch_seq_counts_from_zero_without_gaps() {
        let (mut asm, _) = assembler();
        let seqs: Vec<u32> = (0..40u32)
            .filter_map(|seq| asm.add_frame(frame(seq)))
            .map(|b| b.seq())
            .collect();
        assert_eq!(seqs, (0..10).collect::<Vec<_>>());
        assert_eq!(asm.next_seq(), 10);
    }

    #[test]
    fn test_frames_kept_in_arrival_order() {
        let (mut asm, _) = assembler();
        let batch = (0..FRAMES_PER_BATCH as u32)
            .find_map(|seq| asm.add_frame(frame(seq)))
            .unwrap();
        let seqs: Vec<u32> = batch.frames().iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_timestamp_taken_at_seal() {
        let (mut asm, mock) = assembler();
        for seq in 0..FRAMES_PER_BATCH as u32 - 1 {
            asm.add_frame(frame(seq));
        }
        mock.advance(Duration::from_millis(40));
        let batch = asm.add_frame(frame(3)).unwrap();
        assert_eq!(batch.header().timestamp_ms, 40);
    }

    #[test]
    fn test_header_flags_are_union_of_frame_flags() {
        let (mut asm, _) = assembler();
        let mut f0 = frame(0);
        f0.flags = FrameFlags::QUEUE_OVERFLOW;
        let mut f2 = frame(2);
        f2.flags = FrameFlags::HIGH_NOISE;
        asm.add_frame(f0);
        asm.add_frame(frame(1));
        asm.add_frame(f2);
        let batch = asm.add_frame(frame(3)).unwrap();
        assert_eq!(
            batch.header().flags,
            FrameFlags::QUEUE_OVERFLOW | FrameFlags::HIGH_NOISE
        );

        // Flags do not leak into the next batch.
        let next = (4..8).find_map(|seq| asm.add_frame(frame(seq))).unwrap();
        assert!(next.header().flags.is_empty());
    }

    #[test]
    fn test_discard_partial() {
        let (mut asm, _) = assembler();
        asm.add_frame(frame(0));
        asm.add_frame(frame(1));
        assert_eq!(asm.discard_partial(), 2);
        assert_eq!(asm.pending(), 0);
        assert_eq!(asm.next_seq(), 0);
    }
}
