//! Sample sources feeding the capture stage.

#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod source;
pub mod wav;

#[cfg(feature = "cpal-audio")]
pub use capture::{CpalSampleSource, list_devices};
pub use source::{MockRead, MockSampleSource, SampleSource, ToneSource};
pub use wav::WavSampleSource;
