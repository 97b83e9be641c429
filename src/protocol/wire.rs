//! Fixed binary batch layout.
//!
//! ```text
//! header (16 bytes)
//!   magic         u32 LE
//!   version       u8
//!   reserved[3]   u8   reserved[0] carries batch flags, the rest are zero
//!   batch_seq     u32 LE
//!   timestamp_ms  u32 LE
//! frame record (1932 bytes), repeated FRAMES_PER_BATCH times
//!   frame_seq     u32 LE
//!   vad_prob      f32 LE
//!   rms_raw       f32 LE
//!   raw_pcm       i16 LE x FRAME_SAMPLES
//!   clean_pcm     i16 LE x FRAME_SAMPLES
//! ```

use crate::defaults::{
    BATCH_MAGIC, EXPECTED_BATCH_BYTES, FRAME_SAMPLES, FRAMES_PER_BATCH, PROTOCOL_VERSION,
};
use crate::error::{Result, StreamError};
use crate::pipeline::types::{Batch, BatchHeader, FrameFlags};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

pub const BATCH_HEADER_BYTES: usize = 4 + 1 + 3 + 4 + 4;
pub const FRAME_RECORD_BYTES: usize = 4 + 4 + 4 + 2 * FRAME_SAMPLES * 2;
pub const BATCH_BYTES: usize = BATCH_HEADER_BYTES + FRAMES_PER_BATCH * FRAME_RECORD_BYTES;

const _: () = assert!(BATCH_BYTES == EXPECTED_BATCH_BYTES);

/// Startup check that the computed layout matches the documented size.
pub fn validate_layout() -> Result<()> {
    check_layout(BATCH_BYTES, EXPECTED_BATCH_BYTES)
}

fn check_layout(computed: usize, documented: usize) -> Result<()> {
    if computed != documented {
        return Err(StreamError::ConfigInvalidValue {
            key: "protocol.batch_bytes".to_string(),
            message: format!("computed batch size {computed} does not match documented {documented}"),
        });
    }
    Ok(())
}

/// One decoded frame record.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub frame_seq: u32,
    pub vad_prob: f32,
    pub rms_raw: f32,
    pub raw_pcm: Vec<i16>,
    pub clean_pcm: Vec<i16>,
}

/// A batch read back from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBatch {
    pub header: BatchHeader,
    pub frames: Vec<FrameRecord>,
}

/// Serializes `batch` into `out`, replacing its contents.
pub fn encode_batch(batch: &Batch, out: &mut Vec<u8>) -> Result<()> {
    out.clear();
    out.reserve(BATCH_BYTES);

    let header = batch.header();
    out.write_u32::<LittleEndian>(header.magic)?;
    out.write_u8(header.version)?;
    out.write_all(&[header.flags.bits(), 0, 0])?;
    out.write_u32::<LittleEndian>(header.batch_seq)?;
    out.write_u32::<LittleEndian>(header.timestamp_ms)?;

    for frame in batch.frames() {
        out.write_u32::<LittleEndian>(frame.seq)?;
        out.write_f32::<LittleEndian>(frame.vad)?;
        out.write_f32::<LittleEndian>(frame.rms)?;
        write_pcm(out, &frame.raw)?;
        write_pcm(out, frame.clean_or_raw())?;
    }

    if out.len() != BATCH_BYTES {
        return Err(StreamError::Protocol {
            message: format!("encoded {} bytes, expected {}", out.len(), BATCH_BYTES),
        });
    }
    Ok(())
}

/// Convenience wrapper returning a fresh buffer.
pub fn encode_batch_to_vec(batch: &Batch) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(BATCH_BYTES);
    encode_batch(batch, &mut out)?;
    Ok(out)
}

fn write_pcm(out: &mut Vec<u8>, samples: &[i16]) -> Result<()> {
    if samples.len() != FRAME_SAMPLES {
        return Err(StreamError::Protocol {
            message: format!("frame has {} samples, expected {}", samples.len(), FRAME_SAMPLES),
        });
    }
    for &s in samples {
        out.write_i16::<LittleEndian>(s)?;
    }
    Ok(())
}

/// Parses one packet, checking size, magic and version.
pub fn decode_batch(bytes: &[u8]) -> Result<DecodedBatch> {
    if bytes.len() != BATCH_BYTES {
        return Err(StreamError::Protocol {
            message: format!("packet is {} bytes, expected {}", bytes.len(), BATCH_BYTES),
        });
    }

    let mut cur = Cursor::new(bytes);
    let magic = cur.read_u32::<LittleEndian>()?;
    if magic != BATCH_MAGIC {
        return Err(StreamError::Protocol {
            message: format!("bad magic {magic:#010x}"),
        });
    }
    let version = cur.read_u8()?;
    if version != PROTOCOL_VERSION {
        return Err(StreamError::Protocol {
            message: format!("unsupported version {version}"),
        });
    }
    let mut reserved = [0u8; 3];
    cur.read_exact(&mut reserved)?;
    let batch_seq = cur.read_u32::<LittleEndian>()?;
    let timestamp_ms = cur.read_u32::<LittleEndian>()?;

    let header = BatchHeader {
        magic,
        version,
        flags: FrameFlags::from_bits(reserved[0]),
        batch_seq,
        timestamp_ms,
    };

    let mut frames = Vec::with_capacity(FRAMES_PER_BATCH);
    for _ in 0..FRAMES_PER_BATCH {
        let frame_seq = cur.read_u32::<LittleEndian>()?;
        let vad_prob = cur.read_f32::<LittleEndian>()?;
        let rms_raw = cur.read_f32::<LittleEndian>()?;
        let mut raw_pcm = vec![0i16; FRAME_SAMPLES];
        cur.read_i16_into::<LittleEndian>(&mut raw_pcm)?;
        let mut clean_pcm = vec![0i16; FRAME_SAMPLES];
        cur.read_i16_into::<LittleEndian>(&mut clean_pcm)?;
        frames.push(FrameRecord {
            frame_seq,
            vad_prob,
            rms_raw,
            raw_pcm,
            clean_pcm,
        });
    }

    Ok(DecodedBatch { header, frames })
}
