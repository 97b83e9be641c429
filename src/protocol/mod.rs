//! Wire format shared by the sender and the receiver.

pub mod handshake;
pub mod wire;

pub use handshake::Handshake;
pub use wire::{
    BATCH_BYTES, BATCH_HEADER_BYTES, DecodedBatch, FRAME_RECORD_BYTES, FrameRecord, decode_batch,
    encode_batch, encode_batch_to_vec, validate_layout,
};
