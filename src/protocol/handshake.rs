//! Text handshake sent once per connection, before any batch.

use crate::defaults::{ENCODING, FRAME_SAMPLES, FRAMES_PER_BATCH, PROTOCOL_VERSION, SAMPLE_RATE};
use crate::error::{Result, StreamError};
use serde::{Deserialize, Serialize};

/// Stream parameters announced to the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(rename = "type")]
    pub kind: String,
    pub device: String,
    pub sample_rate: u32,
    pub frame_samples: u32,
    pub frames_per_batch: u32,
    pub encoding: String,
    pub strategy: String,
    pub version: u8,
}

impl Handshake {
    /// Handshake for this build's fixed stream parameters.
    pub fn new(device: &str, strategy: &str) -> Self {
        Self {
            kind: "hello".to_string(),
            device: device.to_string(),
            sample_rate: SAMPLE_RATE,
            frame_samples: FRAME_SAMPLES as u32,
            frames_per_batch: FRAMES_PER_BATCH as u32,
            encoding: ENCODING.to_string(),
            strategy: strategy.to_string(),
            version: PROTOCOL_VERSION,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| StreamError::Protocol {
            message: format!("Failed to encode handshake: {}", e),
        })
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let handshake: Self = serde_json::from_str(text).map_err(|e| StreamError::Protocol {
            message: format!("Invalid handshake: {}", e),
        })?;
        if handshake.kind != "hello" {
            return Err(StreamError::Protocol {
                message: format!("unexpected message type '{}'", handshake.kind),
            });
        }
        Ok(handshake)
    }

    /// Whether the announced parameters match what this build decodes.
    pub fn is_compatible(&self) -> bool {
        self.sample_rate == SAMPLE_RATE
            && self.frame_samples as usize == FRAME_SAMPLES
            && self.frames_per_batch as usize == FRAMES_PER_BATCH
            && self.encoding == ENCODING
            && self.version == PROTOCOL_VERSION
    }
}
