//! Bounded FIFO channel between capture and processing.
//!
//! A thin wrapper over a crossbeam bounded channel that exposes exactly the
//! operations the stages use: zero-wait `try_send`, `send_timeout`, and
//! blocking or timed receive.

use crossbeam_channel::{Receiver, Sender, bounded};
use std::time::Duration;

pub use crossbeam_channel::{RecvTimeoutError, SendTimeoutError, TrySendError};

/// Creates a bounded single-producer/single-consumer queue of the given depth.
pub fn bounded_queue<T>(depth: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = bounded(depth);
    (QueueSender { tx }, QueueReceiver { rx })
}

/// Producer half. Dropping it closes the queue once drained.
#[derive(Debug)]
pub struct QueueSender<T> {
    tx: Sender<T>,
}

impl<T> QueueSender<T> {
    /// Never waits. A full queue hands the item back in `TrySendError::Full`.
    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        self.tx.try_send(item)
    }

    pub fn send_timeout(&self, item: T, timeout: Duration) -> Result<(), SendTimeoutError<T>> {
        self.tx.send_timeout(item, timeout)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tx.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(0)
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct QueueReceiver<T> {
    rx: Receiver<T>,
}

impl<T> QueueReceiver<T> {
    /// Blocks until an item arrives. `None` once the sender is gone and the queue is empty.
    pub fn recv(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_fifo_order_preserved() {
        let (tx, rx) = bounded_queue(8);
        for i in 0..8 {
            tx.try_send(i).unwrap();
        }
        let received: Vec<i32> = (0..8).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(received, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_fifo_order_across_threads() {
        let (tx, rx) = bounded_queue(4);
        let producer = thread::spawn(move || {
            let mut accepted = Vec::new();
            for i in 0..1000u32 {
                if tx.try_send(i).is_ok() {
                    accepted.push(i);
                }
            }
            accepted
        });

        let mut observed = Vec::new();
        while let Some(item) = rx.recv() {
            observed.push(item);
        }
        let accepted = producer.join().unwrap();
        assert_eq!(observed, accepted);
    }

    #[test]
    fn test_try_send_on_full_returns_immediately() {
        let (tx, _rx) = bounded_queue(2);
        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        assert!(tx.is_full());

        let start = Instant::now();
        for _ in 0..1000 {
            match tx.try_send(3) {
                Err(TrySendError::Full(item)) => assert_eq!(item, 3),
                other => panic!("expected Full, got {other:?}"),
            }
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_send_timeout_expires_on_full_queue() {
        let (tx, _rx) = bounded_queue(1);
        tx.try_send(1).unwrap();
        let result = tx.send_timeout(2, Duration::from_millis(10));
        assert!(matches!(result, Err(SendTimeoutError::Timeout(2))));
    }

    #[test]
    fn test_recv_returns_none_after_sender_dropped() {
        let (tx, rx) = bounded_queue(2);
        tx.try_send(5).unwrap();
        drop(tx);
        assert_eq!(rx.recv(), Some(5));
        assert_eq!(rx.recv(), None);
    }

    #[test]
    fn test_recv_timeout_on_empty_queue() {
        let (_tx, rx) = bounded_queue::<u8>(2);
        assert!(matches!(
            rx.recv_timeout(Duration::from_millis(5)),
            Err(RecvTimeoutError::Timeout)
        ));
    }

    #[test]
    fn test_capacity_and_len() {
        let (tx, rx) = bounded_queue(4);
        assert_eq!(tx.capacity(), 4);
        tx.try_send('a').unwrap();
        assert_eq!(tx.len(), 1);
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.try_recv(), Some('a'));
        assert!(rx.is_empty());
    }
}
