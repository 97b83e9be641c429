//! Command-line interface for pcmlink
//!
//! Provides argument parsing using clap derive macros.

use crate::config::SourceKind;
use crate::pipeline::strategy::StrategyKind;
use crate::transport::DisconnectPolicy;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Stream captured audio frames to a WebSocket endpoint
#[derive(Parser, Debug)]
#[command(
    name = "pcmlink",
    version,
    about = "Stream captured audio frames to a WebSocket endpoint"
)]
pub struct Cli {
    /// Subcommand to execute (default: run)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Stream options used when no subcommand is given
    #[command(flatten)]
    pub run: RunArgs,
}

/// Overrides for the streaming pipeline. Anything left unset comes from the
/// config file, then the environment, then built-in defaults.
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct RunArgs {
    /// Receiver host
    #[arg(long, value_name = "HOST")]
    pub host: Option<String>,

    /// Receiver port
    #[arg(long, short = 'p', value_name = "PORT")]
    pub port: Option<u16>,

    /// WebSocket path on the receiver (e.g. /esp32)
    #[arg(long, value_name = "PATH")]
    pub path: Option<String>,

    /// Processing strategy (passthrough, scaled, model)
    #[arg(long, short = 's', value_name = "STRATEGY")]
    pub strategy: Option<StrategyKind>,

    /// Sample source (device, tone, wav)
    #[arg(long, value_name = "SOURCE")]
    pub source: Option<SourceKind>,

    /// Stream a WAV file instead of a live device (implies --source wav)
    #[arg(long, value_name = "FILE")]
    pub wav: Option<PathBuf>,

    /// Audio input device name
    #[arg(long, value_name = "DEVICE")]
    pub device: Option<String>,

    /// What to do with batches while disconnected (drain, hold)
    #[arg(long, value_name = "POLICY")]
    pub policy: Option<DisconnectPolicy>,

    /// Write clean samples to a local WAV file as well
    #[arg(long, value_name = "FILE")]
    pub playback: Option<PathBuf>,

    /// Stop after this long. Examples: 30s, 5m, 1h30m
    #[arg(long, short = 'd', value_name = "DURATION", value_parser = parse_duration)]
    pub duration: Option<Duration>,
}

/// Parse a duration string.
///
/// Supports any duration format accepted by `humantime`: bare numbers (seconds),
/// single-unit (`30s`, `5m`, `2h`), and compound (`1h30m`, `2m30s`).
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    // Bare number → seconds
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Capture, process and stream until interrupted
    Run(RunArgs),

    /// Run a receiver that validates incoming batches and reports loss
    Listen {
        /// Address to bind
        #[arg(long, short = 'b', value_name = "ADDR", default_value = "0.0.0.0:8080")]
        bind: String,
    },

    /// Print the binary batch layout and verify its size
    Layout,

    /// Inspect configuration
    Config {
        /// Action to perform
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// List available audio input devices
    #[cfg(feature = "cpal-audio")]
    Devices,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the default configuration file path
    Path,
}
