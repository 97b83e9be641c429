//! Capture-to-network streaming pipeline.
//!
//! Each stage runs in its own thread. Stages are connected by bounded queues:
//! the frame queue drops on full, the output and playback queues evict their
//! oldest entry. No producer ever waits on a consumer.

pub mod assembler;
pub mod capture;
pub mod clock;
pub mod error;
pub mod orchestrator;
pub mod output_queue;
pub mod playback;
pub mod pool;
pub mod processing;
pub mod queue;
pub mod station;
pub mod strategy;
pub mod types;

pub use assembler::BatchAssembler;
pub use capture::{CaptureStage, CaptureStep};
pub use clock::{Clock, DeviceClock, MockClock, SystemClock};
pub use error::{ErrorReporter, LogReporter, StationError};
pub use orchestrator::{Pipeline, PipelineConfig, PipelineHandle};
pub use output_queue::{EvictingQueue, PushOutcome};
pub use playback::{NullSink, PlaybackSink, PlaybackStation, WavPlaybackSink};
pub use pool::{BufferPool, PoolSizing, PooledBuffer};
pub use processing::ProcessingStation;
pub use queue::{QueueReceiver, QueueSender, bounded_queue};
pub use station::{Inlet, NullOutlet, Outlet, Station, StationRunner};
pub use strategy::{
    ModelStrategy, PassThrough, ProcessingStrategy, ScaledPassThrough, StrategyKind,
    build_strategy, init_with_fallback,
};
pub use types::{Batch, BatchHeader, Frame, FrameFlags, MarkDiscontinuity, PlaybackFrame};
