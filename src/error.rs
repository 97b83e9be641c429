//! Error types for pcmlink.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Audio capture errors
    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    #[error("Audio source exhausted")]
    EndOfStream,

    // Processing errors
    #[error("Strategy '{strategy}' failed to initialize: {message}")]
    StrategyInit { strategy: String, message: String },

    #[error("Buffer pool too small: {capacity} buffers, at least {required} required")]
    PoolUndersized { capacity: usize, required: usize },

    // Wire format errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // Transport errors
    #[error("Connection to {endpoint} failed: {message}")]
    TransportConnect { endpoint: String, message: String },

    #[error("Send failed: {message}")]
    TransportSend { message: String },

    #[error("Transport is not connected")]
    NotConnected,

    // Startup errors
    #[error("Failed to spawn {task} task: {message}")]
    Spawn { task: String, message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, StreamError>;
