//! Fixed-capacity pool of frame sample buffers.
//!
//! Every buffer is allocated once at startup. `acquire` never blocks and never
//! allocates; a `PooledBuffer` goes back to its pool when dropped, so a buffer
//! can only ever be owned by one stage at a time.

use crate::defaults::{FRAMES_PER_BATCH, FRAME_SAMPLES};
use crate::error::{Result, StreamError};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::fmt;
use std::ops::{Deref, DerefMut};

/// One frame's worth of 16-bit samples.
pub type Samples = [i16; FRAME_SAMPLES];

/// Queue depths that determine how many buffers can be live at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizing {
    pub frame_queue_depth: usize,
    pub output_queue_depth: usize,
    pub playback_queue_depth: usize,
    pub margin: usize,
}

impl PoolSizing {
    /// Minimum number of buffers that keeps capture from starving in steady state.
    ///
    /// Frames in flight: one being captured, the frame queue, one being
    /// processed, the batch being assembled, every queued batch, and the batch
    /// held by the sender. Each of those frames holds a raw and a clean buffer.
    /// Playback frames hold one buffer each, plus one in the sink.
    pub fn required_capacity(&self) -> usize {
        let frames_in_flight = 1
            + self.frame_queue_depth
            + 1
            + FRAMES_PER_BATCH
            + (self.output_queue_depth + 1) * FRAMES_PER_BATCH;
        let playback = if self.playback_queue_depth > 0 {
            self.playback_queue_depth + 1
        } else {
            0
        };
        2 * frames_in_flight + playback + self.margin
    }

    /// Resolves the pool capacity, rejecting an explicit value that is too small.
    pub fn resolve(&self, explicit: Option<usize>) -> Result<usize> {
        let required = self.required_capacity();
        match explicit {
            Some(capacity) if capacity < required => {
                Err(StreamError::PoolUndersized { capacity, required })
            }
            Some(capacity) => Ok(capacity),
            None => Ok(required),
        }
    }
}

/// Preallocated buffer pool shared by capture, processing and playback.
#[derive(Clone)]
pub struct BufferPool {
    free_tx: Sender<Box<Samples>>,
    free_rx: Receiver<Box<Samples>>,
    capacity: usize,
}

impl BufferPool {
    /// Allocates `capacity` zeroed buffers.
    pub fn new(capacity: usize) -> Self {
        let (free_tx, free_rx) = bounded(capacity);
        for _ in 0..capacity {
            // Cannot fail: the channel holds exactly `capacity` entries.
            free_tx.try_send(Box::new([0i16; FRAME_SAMPLES])).ok();
        }
        Self {
            free_tx,
            free_rx,
            capacity,
        }
    }

    /// Takes a free buffer, or `None` if every buffer is in use.
    pub fn acquire(&self) -> Option<PooledBuffer> {
        self.free_rx.try_recv().ok().map(|buf| PooledBuffer {
            buf: Some(buf),
            home: Some(self.free_tx.clone()),
        })
    }

    /// Number of buffers currently free.
    pub fn available(&self) -> usize {
        self.free_rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// A frame buffer on loan from a `BufferPool`.
pub struct PooledBuffer {
    // Always `Some` until dropped.
    buf: Option<Box<Samples>>,
    home: Option<Sender<Box<Samples>>>,
}

impl PooledBuffer {
    /// A buffer that belongs to no pool. Used by decoders and tests.
    pub fn detached(samples: &[i16]) -> Self {
        let mut buf = Box::new([0i16; FRAME_SAMPLES]);
        let n = samples.len().min(FRAME_SAMPLES);
        buf[..n].copy_from_slice(&samples[..n]);
        Self {
            buf: Some(buf),
            home: None,
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [i16];

    fn deref(&self) -> &[i16] {
        self.buf.as_deref().map(|b| &b[..]).unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [i16] {
        self.buf.as_deref_mut().map(|b| &mut b[..]).unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let (Some(buf), Some(home)) = (self.buf.take(), self.home.take()) {
            // Fails only when the pool itself is gone; the buffer is freed then.
            home.try_send(buf).ok();
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("pooled", &self.home.is_some())
            .finish()
    }
}
