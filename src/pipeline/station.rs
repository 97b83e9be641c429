//! Core station abstraction and runner for the streaming pipeline.

use crate::error::{Result, StreamError};
use crate::pipeline::error::{ErrorReporter, StationError};
use crate::pipeline::output_queue::{EvictingQueue, PushOutcome};
use crate::pipeline::queue::QueueReceiver;
use crate::pipeline::types::MarkDiscontinuity;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

/// A processing station in the pipeline.
///
/// Each station receives input, processes it, and produces output.
/// Stations run in their own threads and are connected by queues.
pub trait Station: Send + 'static {
    /// The input type this station receives.
    type Input: Send + 'static;
    /// The output type this station produces.
    type Output: Send + 'static;

    /// Processes a single input item.
    ///
    /// Returns:
    /// - `Ok(Some(output))` - Successfully processed and produced output
    /// - `Ok(None)` - Successfully processed but no output yet (e.g., batch still filling)
    /// - `Err(StationError)` - Processing failed
    fn process(&mut self, input: Self::Input) -> std::result::Result<Option<Self::Output>, StationError>;

    /// Returns the name of this station for logging and error reporting.
    fn name(&self) -> &'static str;

    /// Called once after the input closes or a fatal error.
    fn shutdown(&mut self) {}
}

/// Where a station reads from. Blocks until an item arrives; `None` ends the station.
pub trait Inlet<T>: Send + 'static {
    fn recv(&self) -> Option<T>;
}

/// Where a station writes to. Never blocks.
pub trait Outlet<T>: Send + 'static {
    /// Hands an item downstream. `false` means the consumer is gone.
    fn deliver(&self, item: T) -> bool;

    /// Signals that no more items will be delivered.
    fn close(&self) {}
}

impl<T: Send + 'static> Inlet<T> for QueueReceiver<T> {
    fn recv(&self) -> Option<T> {
        QueueReceiver::recv(self)
    }
}

impl<T: Send + 'static> Inlet<T> for EvictingQueue<T> {
    fn recv(&self) -> Option<T> {
        EvictingQueue::recv(self)
    }
}

impl<T: MarkDiscontinuity + Send + 'static> Outlet<T> for EvictingQueue<T> {
    fn deliver(&self, item: T) -> bool {
        self.push(item) != PushOutcome::Closed
    }

    fn close(&self) {
        EvictingQueue::close(self);
    }
}

/// Outlet for terminal stations.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullOutlet;

impl<T: Send + 'static> Outlet<T> for NullOutlet {
    fn deliver(&self, _item: T) -> bool {
        true
    }
}

/// Runs a station in a dedicated, named thread.
pub struct StationRunner<S: Station> {
    handle: Option<JoinHandle<()>>,
    station_name: &'static str,
    _phantom: PhantomData<S>,
}

impl<S: Station> StationRunner<S> {
    /// Spawns `station` on a thread called `thread_name`.
    ///
    /// The outlet is closed when the station stops, so the next stage sees
    /// end-of-stream once it has drained what was already delivered.
    pub fn spawn<I, O>(
        mut station: S,
        inlet: I,
        outlet: O,
        error_reporter: Arc<dyn ErrorReporter>,
        thread_name: &str,
    ) -> Result<Self>
    where
        I: Inlet<S::Input>,
        O: Outlet<S::Output>,
    {
        let station_name = station.name();

        let handle = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                Self::run_station(&mut station, &inlet, &outlet, error_reporter.as_ref());
                outlet.close();
            })
            .map_err(|e| StreamError::Spawn {
                task: thread_name.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            handle: Some(handle),
            station_name,
            _phantom: PhantomData,
        })
    }

    fn run_station<I, O>(station: &mut S, inlet: &I, outlet: &O, error_reporter: &dyn ErrorReporter)
    where
        I: Inlet<S::Input>,
        O: Outlet<S::Output>,
    {
        let station_name = station.name();

        while let Some(input) = inlet.recv() {
            match station.process(input) {
                Ok(Some(output)) => {
                    if !outlet.deliver(output) {
                        debug!(station = station_name, "outlet closed, stopping");
                        break;
                    }
                }
                Ok(None) => {}
                Err(err @ StationError::Recoverable(_)) => {
                    error_reporter.report(station_name, &err);
                }
                Err(err @ StationError::Fatal(_)) => {
                    error_reporter.report(station_name, &err);
                    break;
                }
            }
        }

        station.shutdown();
    }

    /// Waits for the station thread to complete.
    pub fn join(mut self) -> std::result::Result<(), String> {
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| format!("Station '{}' thread panicked", self.station_name))
        } else {
            Ok(())
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Returns the name of the station.
    pub fn name(&self) -> &'static str {
        self.station_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::queue::bounded_queue;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, PartialEq)]
    struct Tagged {
        value: i32,
        gap: bool,
    }

    impl MarkDiscontinuity for Tagged {
        fn mark_discontinuity(&mut self) {
            self.gap = true;
        }
    }

    struct DoublerStation {
        shutdown_called: Arc<AtomicBool>,
    }

    impl Station for DoublerStation {
        type Input = i32;
        type Output = Tagged;

        fn process(&mut self, input: i32) -> std::result::Result<Option<Tagged>, StationError> {
            Ok(Some(Tagged {
                value: input * 2,
                gap: false,
            }))
        }

        fn name(&self) -> &'static str {
            "Doubler"
        }

        fn shutdown(&mut self) {
            self.shutdown_called.store(true, Ordering::SeqCst);
        }
    }

    struct FailingStation {
        fail_on: i32,
        fatal: bool,
    }

    impl Station for FailingStation {
        type Input = i32;
        type Output = Tagged;

        fn process(&mut self, input: i32) -> std::result::Result<Option<Tagged>, StationError> {
            if input == self.fail_on {
                let msg = format!("Failed on {}", input);
                if self.fatal {
                    Err(StationError::Fatal(msg))
                } else {
                    Err(StationError::Recoverable(msg))
                }
            } else if input < 0 {
                Ok(None)
            } else {
                Ok(Some(Tagged {
                    value: input,
                    gap: false,
                }))
            }
        }

        fn name(&self) -> &'static str {
            "Failing"
        }
    }

    #[derive(Default)]
    struct MockReporter {
        errors: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl ErrorReporter for MockReporter {
        fn report(&self, station: &str, error: &StationError) {
            self.errors
                .lock()
                .push((station.to_string(), error.to_string()));
        }
    }

    fn collect(out: &EvictingQueue<Tagged>) -> Vec<i32> {
        std::iter::from_fn(|| out.recv()).map(|t| t.value).collect()
    }

    #[test]
    fn test_station_runner_basic_processing() {
        let (input_tx, input_rx) = bounded_queue(10);
        let out = EvictingQueue::new(10);
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let station = DoublerStation {
            shutdown_called: shutdown_flag.clone(),
        };

        let runner = StationRunner::spawn(
            station,
            input_rx,
            out.clone(),
            Arc::new(MockReporter::default()),
            "test-doubler",
        )
        .unwrap();
        assert_eq!(runner.name(), "Doubler");

        for i in 1..=3 {
            input_tx.try_send(i).unwrap();
        }
        drop(input_tx);

        assert_eq!(collect(&out), vec![2, 4, 6]);
        runner.join().unwrap();
        assert!(shutdown_flag.load(Ordering::SeqCst));
        assert!(out.is_closed());
    }

    #[test]
    fn test_station_runner_skips_empty_results() {
        let (input_tx, input_rx) = bounded_queue(10);
        let out = EvictingQueue::new(10);
        let station = FailingStation {
            fail_on: i32::MAX,
            fatal: false,
        };
        let runner = StationRunner::spawn(
            station,
            input_rx,
            out.clone(),
            Arc::new(MockReporter::default()),
            "test-filter",
        )
        .unwrap();

        for i in [1, -1, 3, -2, 5] {
            input_tx.try_send(i).unwrap();
        }
        drop(input_tx);

        assert_eq!(collect(&out), vec![1, 3, 5]);
        runner.join().unwrap();
    }

    #[test]
    fn test_station_runner_reports_recoverable_and_continues() {
        let (input_tx, input_rx) = bounded_queue(10);
        let out = EvictingQueue::new(10);
        let reporter = Arc::new(MockReporter::default());
        let errors = reporter.errors.clone();
        let station = FailingStation {
            fail_on: 2,
            fatal: false,
        };
        let runner =
            StationRunner::spawn(station, input_rx, out.clone(), reporter, "test-failing").unwrap();

        for i in 1..=3 {
            input_tx.try_send(i).unwrap();
        }
        drop(input_tx);

        assert_eq!(collect(&out), vec![1, 3]);
        runner.join().unwrap();

        let reported = errors.lock();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].0, "Failing");
        assert!(reported[0].1.contains("Failed on 2"));
    }

    #[test]
    fn test_station_runner_stops_on_fatal() {
        let (input_tx, input_rx) = bounded_queue(10);
        let out = EvictingQueue::new(10);
        let reporter = Arc::new(MockReporter::default());
        let errors = reporter.errors.clone();
        let station = FailingStation {
            fail_on: 2,
            fatal: true,
        };
        let runner =
            StationRunner::spawn(station, input_rx, out.clone(), reporter, "test-fatal").unwrap();

        for i in 1..=3 {
            input_tx.try_send(i).unwrap();
        }

        assert_eq!(collect(&out), vec![1]);
        runner.join().unwrap();
        assert_eq!(errors.lock().len(), 1);
    }

    #[test]
    fn test_station_runner_stops_when_outlet_closed() {
        let (input_tx, input_rx) = bounded_queue(10);
        let out: EvictingQueue<Tagged> = EvictingQueue::new(10);
        out.close();
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let station = DoublerStation {
            shutdown_called: shutdown_flag.clone(),
        };
        let runner = StationRunner::spawn(
            station,
            input_rx,
            out,
            Arc::new(MockReporter::default()),
            "test-closed",
        )
        .unwrap();

        input_tx.try_send(1).unwrap();
        runner.join().unwrap();
        assert!(shutdown_flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_null_outlet_accepts_everything() {
        let outlet = NullOutlet;
        assert!(Outlet::<i32>::deliver(&outlet, 5));
    }
}
