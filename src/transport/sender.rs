//! Transmit sender: owns the connection and drains the output queue.
//!
//! ```text
//! Disconnected --(interval; first attempt immediate)--> Connecting
//! Connecting   --ok + handshake--> Connected
//! Connecting   --error--> Disconnected
//! Connected    --send error / remote close--> Disconnected
//! ```
//!
//! Each batch gets one send attempt. Nothing is sent unless the transport
//! reports itself connected.

use super::{Endpoint, Transport, TransportEvent};
use crate::defaults::{CONNECT_TIMEOUT_MS, READ_TIMEOUT_MS, RECONNECT_INTERVAL_MS};
use crate::error::{Result, StreamError};
use crate::pipeline::output_queue::EvictingQueue;
use crate::pipeline::queue::RecvTimeoutError;
use crate::pipeline::types::Batch;
use crate::protocol::{Handshake, encode_batch};
use crate::telemetry::Telemetry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What the sender does with queued batches while it has no connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectPolicy {
    /// Keep consuming and discard, so the queue holds only post-reconnect data.
    #[default]
    Drain,
    /// Leave batches queued; eviction keeps the freshest ones for after reconnect.
    Hold,
}

impl DisconnectPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Drain => "drain",
            Self::Hold => "hold",
        }
    }
}

impl fmt::Display for DisconnectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DisconnectPolicy {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "drain" => Ok(Self::Drain),
            "hold" => Ok(Self::Hold),
            other => Err(StreamError::ConfigInvalidValue {
                key: "transmit.disconnect_policy".to_string(),
                message: format!("unknown policy '{other}', expected drain or hold"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub endpoint: Endpoint,
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,
    /// Longest wait on the output queue before servicing the socket again.
    pub poll_interval: Duration,
    pub policy: DisconnectPolicy,
    pub device_name: String,
    pub strategy_name: String,
}

impl SenderConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            reconnect_interval: Duration::from_millis(RECONNECT_INTERVAL_MS),
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            poll_interval: Duration::from_millis(READ_TIMEOUT_MS),
            policy: DisconnectPolicy::default(),
            device_name: "pcmlink".to_string(),
            strategy_name: "passthrough".to_string(),
        }
    }
}

pub struct TransmitSender {
    config: SenderConfig,
    transport: Box<dyn Transport>,
    queue: EvictingQueue<Batch>,
    telemetry: Arc<Telemetry>,
    state: LinkState,
    link_lost: Arc<AtomicBool>,
    connect_failures: u64,
    encoded: Vec<u8>,
}

impl TransmitSender {
    pub fn new(
        config: SenderConfig,
        mut transport: Box<dyn Transport>,
        queue: EvictingQueue<Batch>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let link_lost = Arc::new(AtomicBool::new(false));
        let flag = link_lost.clone();
        transport.set_event_handler(Box::new(move |event| match event {
            TransportEvent::Disconnected => flag.store(true, Ordering::SeqCst),
            TransportEvent::Text(text) => debug!(%text, "receiver message"),
            TransportEvent::Error(message) => warn!(%message, "transport error"),
            TransportEvent::Connected => {}
        }));

        Self {
            config,
            transport,
            queue,
            telemetry,
            state: LinkState::Disconnected,
            link_lost,
            connect_failures: 0,
            encoded: Vec::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Runs the sender on a thread named `pcmlink-transmit`.
    pub fn spawn(self, running: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("pcmlink-transmit".to_string())
            .spawn(move || self.run(&running))
            .map_err(|e| StreamError::Spawn {
                task: "transmit".to_string(),
                message: e.to_string(),
            })
    }

    /// Drives the state machine until `running` clears or the output queue is
    /// closed and drained.
    pub fn run(mut self, running: &AtomicBool) {
        let mut first_attempt = true;

        while running.load(Ordering::SeqCst) {
            match self.state {
                LinkState::Disconnected => {
                    if self.upstream_finished() {
                        break;
                    }
                    if !first_attempt && !self.wait_reconnect(running) {
                        break;
                    }
                    first_attempt = false;
                    self.state = LinkState::Connecting;
                }
                LinkState::Connecting => {
                    if self.establish() {
                        self.state = LinkState::Connected;
                    } else {
                        self.state = LinkState::Disconnected;
                        if self.queue.is_closed() {
                            // Upstream is done and nobody is listening.
                            self.discard_remaining();
                            break;
                        }
                    }
                }
                LinkState::Connected => {
                    if !self.pump() {
                        break;
                    }
                }
            }
        }

        self.transport.close();
        debug!("transmit sender stopped");
    }

    fn upstream_finished(&self) -> bool {
        self.queue.is_closed() && self.queue.is_empty()
    }

    /// Opens the connection and sends the handshake.
    fn establish(&mut self) -> bool {
        self.link_lost.store(false, Ordering::SeqCst);
        let endpoint = &self.config.endpoint;

        if let Err(e) = self.transport.connect(endpoint, self.config.connect_timeout) {
            self.connect_failures += 1;
            Telemetry::incr(&self.telemetry.connect_failures);
            if self.connect_failures == 1 {
                warn!(endpoint = %endpoint, error = %e, "connect failed, retrying every {}ms",
                    self.config.reconnect_interval.as_millis());
            } else {
                debug!(attempt = self.connect_failures, error = %e, "connect failed");
            }
            return false;
        }

        let hello = Handshake::new(&self.config.device_name, &self.config.strategy_name);
        let sent = hello
            .to_json()
            .and_then(|text| self.transport.send_text(&text));
        if let Err(e) = sent {
            warn!(error = %e, "handshake failed");
            self.transport.close();
            return false;
        }

        self.connect_failures = 0;
        Telemetry::incr(&self.telemetry.connects);
        info!(endpoint = %self.config.endpoint, "streaming");
        true
    }

    /// One connected iteration. Returns `false` once the queue is finished.
    fn pump(&mut self) -> bool {
        self.transport.poll();
        if self.link_down() {
            self.on_disconnect();
            return true;
        }

        match self.queue.recv_timeout(self.config.poll_interval) {
            Ok(batch) => {
                self.send(&batch);
                true
            }
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    fn link_down(&self) -> bool {
        self.link_lost.load(Ordering::SeqCst) || !self.transport.is_connected()
    }

    fn send(&mut self, batch: &Batch) {
        if self.link_down() {
            Telemetry::incr(&self.telemetry.dropped_disconnected);
            self.on_disconnect();
            return;
        }

        if let Err(e) = encode_batch(batch, &mut self.encoded) {
            Telemetry::incr(&self.telemetry.send_failures);
            warn!(batch_seq = batch.seq(), error = %e, "failed to encode batch");
            return;
        }

        match self.transport.send_binary(&self.encoded) {
            Ok(()) => Telemetry::incr(&self.telemetry.batches_sent),
            Err(e) => {
                Telemetry::incr(&self.telemetry.send_failures);
                warn!(batch_seq = batch.seq(), error = %e, "send failed, batch dropped");
                if self.link_down() {
                    self.on_disconnect();
                }
            }
        }
    }

    fn on_disconnect(&mut self) {
        if self.state == LinkState::Connected {
            Telemetry::incr(&self.telemetry.disconnects);
            warn!(endpoint = %self.config.endpoint, "connection lost");
        }
        self.transport.close();
        self.state = LinkState::Disconnected;
    }

    /// Waits out the reconnect interval, applying the disconnect policy.
    /// Returns `false` if the sender should stop instead.
    fn wait_reconnect(&mut self, running: &AtomicBool) -> bool {
        let deadline = Instant::now() + self.config.reconnect_interval;
        let tick = self.config.poll_interval.max(Duration::from_millis(1));

        loop {
            if !running.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let wait = tick.min(deadline - now);
            match self.config.policy {
                DisconnectPolicy::Drain => match self.queue.recv_timeout(wait) {
                    Ok(batch) => {
                        Telemetry::incr(&self.telemetry.dropped_disconnected);
                        debug!(batch_seq = batch.seq(), "disconnected, batch discarded");
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return false,
                },
                DisconnectPolicy::Hold => thread::sleep(wait),
            }
        }
    }

    fn discard_remaining(&mut self) {
        let mut discarded = 0u64;
        while let Some(batch) = self.queue.try_recv() {
            drop(batch);
            Telemetry::incr(&self.telemetry.dropped_disconnected);
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, "input finished while disconnected, batches discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::FRAME_SAMPLES;
    use crate::pipeline::assembler::BatchAssembler;
    use crate::pipeline::clock::{DeviceClock, MockClock};
    use crate::pipeline::pool::PooledBuffer;
    use crate::pipeline::types::Frame;
    use crate::protocol::{BATCH_BYTES, decode_batch};
    use crate::transport::MockTransport;

    fn batches(count: usize) -> Vec<Batch> {
        let mut assembler = BatchAssembler::new(DeviceClock::new(Arc::new(MockClock::new())));
        let mut out = Vec::new();
        let mut seq = 0;
        while out.len() < count {
            let frame = Frame::new(seq, 0, PooledBuffer::detached(&[0i16; FRAME_SAMPLES]));
            seq += 1;
            if let Some(batch) = assembler.add_frame(frame) {
                out.push(batch);
            }
        }
        out
    }

    fn config(policy: DisconnectPolicy) -> SenderConfig {
        let mut config = SenderConfig::new(Endpoint::new("127.0.0.1", 9, "/esp32"));
        config.reconnect_interval = Duration::from_millis(20);
        config.poll_interval = Duration::from_millis(5);
        config.policy = policy;
        config
    }

    fn queue_with(count: usize, close: bool) -> EvictingQueue<Batch> {
        let queue = EvictingQueue::new(8);
        for batch in batches(count) {
            queue.push(batch);
        }
        if close {
            queue.close();
        }
        queue
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("drain".parse::<DisconnectPolicy>().unwrap(), DisconnectPolicy::Drain);
        assert_eq!("HOLD".parse::<DisconnectPolicy>().unwrap(), DisconnectPolicy::Hold);
        assert!("retry".parse::<DisconnectPolicy>().is_err());
        assert_eq!(DisconnectPolicy::default(), DisconnectPolicy::Drain);
    }

    #[test]
    fn test_handshake_precedes_batches() {
        let transport = MockTransport::new();
        let telemetry = Telemetry::new();
        let sender = TransmitSender::new(
            config(DisconnectPolicy::Drain),
            Box::new(transport.clone()),
            queue_with(2, true),
            telemetry.clone(),
        );
        sender.run(&AtomicBool::new(true));

        let text = transport.sent_text();
        assert_eq!(text.len(), 1);
        let hello = Handshake::from_json(&text[0]).unwrap();
        assert_eq!(hello.frame_samples as usize, FRAME_SAMPLES);

        let sent = transport.sent_binary();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|b| b.len() == BATCH_BYTES));
        let seqs: Vec<u32> = sent
            .iter()
            .map(|b| decode_batch(b).unwrap().header.batch_seq)
            .collect();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(telemetry.snapshot().batches_sent, 2);
        assert_eq!(telemetry.snapshot().connects, 1);
    }

    #[test]
    fn test_no_sends_while_disconnected() {
        let transport = MockTransport::new().with_refused_connects(usize::MAX);
        let telemetry = Telemetry::new();
        let queue = EvictingQueue::new(4);
        let sender = TransmitSender::new(
            config(DisconnectPolicy::Drain),
            Box::new(transport.clone()),
            queue.clone(),
            telemetry.clone(),
        );
        let running = Arc::new(AtomicBool::new(true));
        let handle = sender.spawn(running.clone()).unwrap();

        for batch in batches(6) {
            queue.push(batch);
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(60));
        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();

        assert_eq!(transport.sends_while_disconnected(), 0);
        assert!(transport.sent_binary().is_empty());
        assert!(transport.sent_text().is_empty());
        assert!(transport.connect_attempts() >= 2);
        let snap = telemetry.snapshot();
        assert!(snap.dropped_disconnected > 0);
        assert_eq!(snap.batches_sent, 0);
    }

    #[test]
    fn test_closed_queue_while_disconnected_discards_and_exits() {
        let transport = MockTransport::new().with_refused_connects(usize::MAX);
        let telemetry = Telemetry::new();
        let sender = TransmitSender::new(
            config(DisconnectPolicy::Hold),
            Box::new(transport.clone()),
            queue_with(3, true),
            telemetry.clone(),
        );
        sender.run(&AtomicBool::new(true));

        assert_eq!(transport.connect_attempts(), 1);
        assert_eq!(telemetry.snapshot().dropped_disconnected, 3);
        assert_eq!(transport.sends_while_disconnected(), 0);
    }

    #[test]
    fn test_reconnect_resends_handshake_under_hold() {
        let transport = MockTransport::new().with_drop_after(1);
        let telemetry = Telemetry::new();
        let sender = TransmitSender::new(
            config(DisconnectPolicy::Hold),
            Box::new(transport.clone()),
            queue_with(3, true),
            telemetry.clone(),
        );
        sender.run(&AtomicBool::new(true));

        assert_eq!(transport.sent_text().len(), 2);
        assert_eq!(transport.sent_binary().len(), 3);
        let snap = telemetry.snapshot();
        assert_eq!(snap.connects, 2);
        assert_eq!(snap.disconnects, 1);
        assert_eq!(snap.dropped_disconnected, 0);
    }

    #[test]
    fn test_first_connect_is_immediate() {
        let transport = MockTransport::new();
        let mut cfg = config(DisconnectPolicy::Drain);
        cfg.reconnect_interval = Duration::from_secs(30);
        let sender = TransmitSender::new(
            cfg,
            Box::new(transport.clone()),
            queue_with(1, true),
            Telemetry::new(),
        );
        let started = Instant::now();
        sender.run(&AtomicBool::new(true));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(transport.sent_binary().len(), 1);
    }

    #[test]
    fn test_send_failure_is_not_retried() {
        let transport = MockTransport::new().with_send_failures();
        let telemetry = Telemetry::new();
        let sender = TransmitSender::new(
            config(DisconnectPolicy::Drain),
            Box::new(transport.clone()),
            queue_with(2, true),
            telemetry.clone(),
        );
        sender.run(&AtomicBool::new(true));

        let snap = telemetry.snapshot();
        assert_eq!(snap.send_failures, 2);
        assert_eq!(snap.batches_sent, 0);
        assert_eq!(transport.connect_attempts(), 1);
        assert!(transport.sent_binary().is_empty());
    }

    #[test]
    fn test_stop_flag_ends_idle_sender() {
        let transport = MockTransport::new();
        let queue: EvictingQueue<Batch> = EvictingQueue::new(2);
        let sender = TransmitSender::new(
            config(DisconnectPolicy::Drain),
            Box::new(transport.clone()),
            queue,
            Telemetry::new(),
        );
        let running = Arc::new(AtomicBool::new(true));
        let handle = sender.spawn(running.clone()).unwrap();
        thread::sleep(Duration::from_millis(30));
        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(!transport.is_connected());
    }
}
