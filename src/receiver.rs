//! Reference receiver for `pcmlink listen`.
//!
//! Accepts WebSocket connections, checks every binary packet against the wire
//! layout and tracks batch-sequence gaps per connection.

use crate::error::{Result, StreamError};
use crate::pipeline::types::{BatchHeader, FrameFlags};
use crate::protocol::{DecodedBatch, Handshake, decode_batch};
use futures_util::StreamExt;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::{debug, info, warn};

/// Batches per `info!` progress line (about one second of audio).
const PROGRESS_EVERY: u64 = 25;

/// Floor for the level readout of digital silence.
const SILENCE_DBFS: f32 = -120.0;

/// Detects lost batches from gaps in `batch_seq`.
#[derive(Debug, Default, Clone)]
pub struct LossTracker {
    expected: Option<u32>,
    received: u64,
    lost: u64,
    restarts: u64,
}

impl LossTracker {
    /// Records one batch and returns how many were missing before it.
    ///
    /// A sequence number that goes backwards is treated as a sender restart,
    /// not as loss.
    pub fn observe(&mut self, batch_seq: u32) -> u32 {
        self.received += 1;
        let gap = match self.expected {
            Some(expected) => {
                let gap = batch_seq.wrapping_sub(expected);
                if gap > u32::MAX / 2 {
                    self.restarts += 1;
                    0
                } else {
                    gap
                }
            }
            None => 0,
        };
        self.lost += u64::from(gap);
        self.expected = Some(batch_seq.wrapping_add(1));
        gap
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Lost batches as a share of all expected ones.
    pub fn loss_ratio(&self) -> f64 {
        let expected = self.received + self.lost;
        if expected == 0 {
            0.0
        } else {
            self.lost as f64 / expected as f64
        }
    }
}

/// Levels of one decoded batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchSummary {
    pub batch_seq: u32,
    pub flags: FrameFlags,
    pub peak: u16,
    pub rms_dbfs: f32,
    pub max_vad: f32,
}

pub fn summarize(batch: &DecodedBatch) -> BatchSummary {
    let mut peak = 0u16;
    let mut sum_sq = 0f64;
    let mut count = 0usize;
    let mut max_vad = 0f32;

    for frame in &batch.frames {
        for &s in &frame.raw_pcm {
            peak = peak.max(s.unsigned_abs());
            sum_sq += f64::from(s) * f64::from(s);
        }
        count += frame.raw_pcm.len();
        max_vad = max_vad.max(frame.vad_prob);
    }

    let rms = if count == 0 {
        0.0
    } else {
        (sum_sq / count as f64).sqrt() / 32768.0
    };
    let rms_dbfs = if rms > 0.0 {
        ((20.0 * rms.log10()) as f32).max(SILENCE_DBFS)
    } else {
        SILENCE_DBFS
    };

    BatchSummary {
        batch_seq: batch.header.batch_seq,
        flags: batch.header.flags,
        peak,
        rms_dbfs,
        max_vad,
    }
}

/// What one connection delivered.
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub handshake: Option<Handshake>,
    pub batches: u64,
    pub lost: u64,
    pub invalid: u64,
    pub discontinuities: u64,
    pub texts: u64,
}

/// Reads one connection to its end.
pub async fn handle_connection<S>(mut ws: WebSocketStream<S>, peer: SocketAddr) -> ConnectionStats
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stats = ConnectionStats::default();
    let mut tracker = LossTracker::default();

    while let Some(message) = ws.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(%peer, error = %e, "websocket error");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                stats.texts += 1;
                match Handshake::from_json(&text) {
                    Ok(hello) => {
                        if hello.is_compatible() {
                            info!(%peer, device = %hello.device, strategy = %hello.strategy,
                                rate = hello.sample_rate, "stream announced");
                        } else {
                            warn!(%peer, ?hello, "incompatible stream parameters");
                        }
                        stats.handshake = Some(hello);
                    }
                    Err(e) => debug!(%peer, error = %e, "ignoring text message"),
                }
            }
            Message::Binary(bytes) => match decode_batch(&bytes) {
                Ok(batch) => {
                    on_batch(&batch.header, &mut tracker, &mut stats, peer);
                    let summary = summarize(&batch);
                    debug!(
                        batch_seq = summary.batch_seq,
                        peak = summary.peak,
                        rms_dbfs = format!("{:.1}", summary.rms_dbfs),
                        max_vad = summary.max_vad,
                        flags = ?summary.flags,
                        "batch"
                    );
                    if stats.batches % PROGRESS_EVERY == 0 {
                        info!(%peer, batches = stats.batches, lost = stats.lost,
                            peak = summary.peak, rms_dbfs = format!("{:.1}", summary.rms_dbfs),
                            "receiving");
                    }
                }
                Err(e) => {
                    stats.invalid += 1;
                    warn!(%peer, error = %e, "invalid packet");
                }
            },
            Message::Close(frame) => {
                debug!(%peer, ?frame, "close frame");
                break;
            }
            _ => {}
        }
    }

    info!(
        %peer,
        batches = stats.batches,
        lost = stats.lost,
        invalid = stats.invalid,
        loss = format!("{:.2}%", tracker.loss_ratio() * 100.0),
        "connection closed"
    );
    stats
}

fn on_batch(
    header: &BatchHeader,
    tracker: &mut LossTracker,
    stats: &mut ConnectionStats,
    peer: SocketAddr,
) {
    let gap = tracker.observe(header.batch_seq);
    if gap > 0 {
        warn!(%peer, batch_seq = header.batch_seq, missing = gap, "batch gap");
    }
    if header.flags.contains(FrameFlags::DISCONTINUITY) {
        stats.discontinuities += 1;
        debug!(%peer, batch_seq = header.batch_seq, "sender reported discontinuity");
    }
    stats.batches = tracker.received();
    stats.lost = tracker.lost();
}

/// Accepts connections until the listener fails. Each connection gets a task.
pub async fn serve(listener: TcpListener) -> Result<()> {
    let local = listener.local_addr()?;
    info!(address = %local, "listening");

    loop {
        let (stream, peer) = listener.accept().await.map_err(|e| StreamError::Other(
            format!("Failed to accept connection: {}", e),
        ))?;
        tokio::spawn(async move {
            match accept_async(stream).await {
                Ok(ws) => {
                    info!(%peer, "client connected");
                    handle_connection(ws, peer).await;
                }
                Err(e) => warn!(%peer, error = %e, "websocket handshake failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::{FRAME_SAMPLES, FRAMES_PER_BATCH};
    use crate::pipeline::assembler::BatchAssembler;
    use crate::pipeline::clock::{DeviceClock, MockClock};
    use crate::pipeline::pool::PooledBuffer;
    use crate::pipeline::types::Frame;
    use crate::protocol::{FrameRecord, encode_batch_to_vec};
    use futures_util::SinkExt;
    use std::sync::Arc;
    use tokio_tungstenite::connect_async;

    fn record(fill: i16, vad: f32) -> FrameRecord {
        FrameRecord {
            frame_seq: 0,
            vad_prob: vad,
            rms_raw: 0.0,
            raw_pcm: vec![fill; FRAME_SAMPLES],
            clean_pcm: vec![fill; FRAME_SAMPLES],
        }
    }

    fn encoded_batches(count: usize) -> Vec<Vec<u8>> {
        let mut assembler = BatchAssembler::new(DeviceClock::new(Arc::new(MockClock::new())));
        let mut out = Vec::new();
        let mut seq = 0;
        while out.len() < count {
            let frame = Frame::new(seq, 0, PooledBuffer::detached(&[100i16; FRAME_SAMPLES]));
            seq += 1;
            if let Some(batch) = assembler.add_frame(frame) {
                out.push(encode_batch_to_vec(&batch).unwrap());
            }
        }
        out
    }

    #[test]
    fn test_loss_tracker_counts_gaps() {
        let mut tracker = LossTracker::default();
        assert_eq!(tracker.observe(0), 0);
        assert_eq!(tracker.observe(1), 0);
        assert_eq!(tracker.observe(4), 2);
        assert_eq!(tracker.received(), 3);
        assert_eq!(tracker.lost(), 2);
        assert!((tracker.loss_ratio() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_loss_tracker_wraps_and_restarts() {
        let mut tracker = LossTracker::default();
        tracker.observe(u32::MAX);
        assert_eq!(tracker.observe(0), 0);
        assert_eq!(tracker.lost(), 0);

        tracker.observe(50);
        assert_eq!(tracker.observe(3), 0);
        assert_eq!(tracker.restarts(), 1);
    }

    #[test]
    fn test_summarize_levels() {
        let batch = DecodedBatch {
            header: BatchHeader::sealed(7, 0, FrameFlags::NONE),
            frames: vec![
                record(0, 0.1),
                record(-16384, 0.9),
                record(0, 0.0),
                record(0, 0.3),
            ],
        };
        let summary = summarize(&batch);
        assert_eq!(summary.batch_seq, 7);
        assert_eq!(summary.peak, 16384);
        assert_eq!(summary.max_vad, 0.9);
        // rms = 0.5 / sqrt(4) = 0.25 -> about -12 dBFS
        assert!((summary.rms_dbfs - (-12.04)).abs() < 0.05);
    }

    #[test]
    fn test_summarize_silence_is_floored() {
        let batch = DecodedBatch {
            header: BatchHeader::sealed(0, 0, FrameFlags::NONE),
            frames: (0..FRAMES_PER_BATCH).map(|_| record(0, 0.0)).collect(),
        };
        assert_eq!(summarize(&batch).rms_dbfs, SILENCE_DBFS);
    }

    #[tokio::test]
    async fn test_connection_stats_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            handle_connection(ws, peer).await
        });

        let (mut client, _) = connect_async(format!("ws://{addr}/esp32")).await.unwrap();
        let hello = Handshake::new("test-device", "passthrough").to_json().unwrap();
        client.send(Message::Text(hello)).await.unwrap();

        let batches = encoded_batches(4);
        client.send(Message::Binary(batches[0].clone())).await.unwrap();
        client.send(Message::Binary(batches[1].clone())).await.unwrap();
        // batch 2 never arrives
        client.send(Message::Binary(batches[3].clone())).await.unwrap();
        client.send(Message::Binary(vec![0u8; 64])).await.unwrap();
        client.close(None).await.unwrap();

        let stats = server.await.unwrap();
        assert_eq!(stats.handshake.unwrap().device, "test-device");
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.discontinuities, 0);
    }
}
