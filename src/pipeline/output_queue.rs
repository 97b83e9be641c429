//! Bounded output queue that evicts its oldest entry instead of blocking.
//!
//! Pushing into a full queue discards the front item, marks the new item as
//! discontinuous and appends it. Producers never wait. Each queue owns its own
//! eviction counter, so two queues never share overflow accounting.

use crate::pipeline::queue::RecvTimeoutError;
use crate::pipeline::types::MarkDiscontinuity;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Result of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended without displacing anything.
    Queued,
    /// The oldest entry was dropped to make room.
    Evicted,
    /// The queue was closed; the item was dropped.
    Closed,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
    capacity: usize,
    evictions: AtomicU64,
}

/// Multi-handle evicting FIFO. Clones refer to the same queue.
pub struct EvictingQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for EvictingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: MarkDiscontinuity> EvictingQueue<T> {
    /// Creates a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: VecDeque::with_capacity(capacity),
                    closed: false,
                }),
                ready: Condvar::new(),
                capacity,
                evictions: AtomicU64::new(0),
            }),
        }
    }

    /// Appends without waiting, evicting the oldest entry when full.
    pub fn push(&self, mut item: T) -> PushOutcome {
        let evicted = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            let evicted = if state.items.len() >= self.shared.capacity {
                let oldest = state.items.pop_front();
                item.mark_discontinuity();
                self.shared.evictions.fetch_add(1, Ordering::Relaxed);
                oldest
            } else {
                None
            };
            state.items.push_back(item);
            evicted
        };
        self.shared.ready.notify_one();

        // Dropped outside the lock; batches return pool buffers on drop.
        match evicted {
            Some(oldest) => {
                drop(oldest);
                PushOutcome::Evicted
            }
            None => PushOutcome::Queued,
        }
    }
}

impl<T> EvictingQueue<T> {
    /// Blocks until an item is available. `None` once closed and drained.
    pub fn recv(&self) -> Option<T> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.shared.ready.wait(&mut state);
        }
    }

    /// Waits up to `timeout`. `Disconnected` means closed and drained.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            if state.closed {
                return Err(RecvTimeoutError::Disconnected);
            }
            if self
                .shared
                .ready
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state
                    .items
                    .pop_front()
                    .ok_or(RecvTimeoutError::Timeout);
            }
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        self.shared.state.lock().items.pop_front()
    }

    /// Rejects further pushes and wakes every waiting receiver.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Total entries discarded by eviction since creation.
    pub fn evictions(&self) -> u64 {
        self.shared.evictions.load(Ordering::Relaxed)
    }
}

impl<T> std::fmt::Debug for EvictingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictingQueue")
            .field("len", &self.len())
            .field("capacity", &self.shared.capacity)
            .field("evictions", &self.evictions())
            .finish()
    }
}
