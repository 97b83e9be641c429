//! Error types and reporting for pipeline stations.

use std::fmt;
use tracing::{error, warn};

/// Errors that can occur while a station handles one item.
#[derive(Debug, Clone)]
pub enum StationError {
    /// The item is lost but the station keeps running.
    Recoverable(String),
    /// The station must shut down.
    Fatal(String),
}

impl fmt::Display for StationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StationError::Recoverable(msg) => write!(f, "Recoverable error: {}", msg),
            StationError::Fatal(msg) => write!(f, "Fatal error: {}", msg),
        }
    }
}

impl std::error::Error for StationError {}

/// Trait for reporting station errors.
pub trait ErrorReporter: Send + Sync {
    /// Reports an error from a station.
    fn report(&self, station: &str, error: &StationError);
}

/// Reporter that forwards to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, station: &str, err: &StationError) {
        match err {
            StationError::Recoverable(msg) => warn!(station, "{msg}"),
            StationError::Fatal(msg) => error!(station, "{msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_station_error_display() {
        let recoverable = StationError::Recoverable("encode failed".to_string());
        assert_eq!(recoverable.to_string(), "Recoverable error: encode failed");

        let fatal = StationError::Fatal("pool gone".to_string());
        assert_eq!(fatal.to_string(), "Fatal error: pool gone");
    }

    #[test]
    fn test_log_reporter() {
        let reporter = LogReporter;
        reporter.report("process", &StationError::Recoverable("test error".to_string()));
        reporter.report("process", &StationError::Fatal("test error".to_string()));
    }
}
