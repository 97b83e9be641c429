//! Network transport used by the transmit sender.

pub mod sender;
pub mod websocket;

use crate::error::{Result, StreamError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use sender::{DisconnectPolicy, LinkState, SenderConfig, TransmitSender};
pub use websocket::WsTransport;

/// Remote WebSocket endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    pub fn new(host: &str, port: u16, path: &str) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Self {
            host: host.to_string(),
            port,
            path,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.path)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Notifications delivered through the event handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Text(String),
    Error(String),
}

pub type EventHandler = Box<dyn FnMut(&TransportEvent) + Send>;

/// A persistent message connection to one endpoint.
///
/// All calls block the calling thread; the sender owns its own thread so
/// nothing upstream ever waits on the network.
pub trait Transport: Send {
    /// Opens the connection, giving up after `timeout`.
    fn connect(&mut self, endpoint: &Endpoint, timeout: Duration) -> Result<()>;

    fn send_binary(&mut self, bytes: &[u8]) -> Result<()>;

    fn send_text(&mut self, text: &str) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn set_event_handler(&mut self, handler: EventHandler);

    /// Services incoming traffic without blocking. Detects remote closure.
    fn poll(&mut self) {}

    fn close(&mut self);
}

#[derive(Default)]
struct MockState {
    connected: bool,
    refuse_connects: usize,
    fail_sends: bool,
    drop_after_sends: Option<usize>,
    connect_attempts: usize,
    sent_binary: Vec<Vec<u8>>,
    sent_text: Vec<String>,
    sends_while_disconnected: usize,
    handler: Option<EventHandler>,
}

/// In-memory transport for testing. Clones share state.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` connect attempts fail.
    pub fn with_refused_connects(self, n: usize) -> Self {
        self.state.lock().refuse_connects = n;
        self
    }

    /// Every binary send fails but the connection stays up.
    pub fn with_send_failures(self) -> Self {
        self.state.lock().fail_sends = true;
        self
    }

    /// The connection drops after this many successful binary sends.
    pub fn with_drop_after(self, sends: usize) -> Self {
        self.state.lock().drop_after_sends = Some(sends);
        self
    }

    /// Simulates the remote end going away.
    pub fn drop_connection(&self) {
        self.state.lock().connected = false;
        self.emit(&TransportEvent::Disconnected);
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    pub fn sent_binary(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent_binary.clone()
    }

    pub fn sent_text(&self) -> Vec<String> {
        self.state.lock().sent_text.clone()
    }

    /// Sends attempted while not connected. Should always be zero.
    pub fn sends_while_disconnected(&self) -> usize {
        self.state.lock().sends_while_disconnected
    }

    fn emit(&self, event: &TransportEvent) {
        // Run the handler outside the lock so it may query the mock.
        let handler = self.state.lock().handler.take();
        if let Some(mut handler) = handler {
            handler(event);
            let mut state = self.state.lock();
            if state.handler.is_none() {
                state.handler = Some(handler);
            }
        }
    }

    fn check_send(&self, binary: bool) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            state.sends_while_disconnected += 1;
            return Err(StreamError::NotConnected);
        }
        if binary && state.fail_sends {
            return Err(StreamError::TransportSend {
                message: "mock send failure".to_string(),
            });
        }
        Ok(())
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, endpoint: &Endpoint, _timeout: Duration) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            if state.refuse_connects > 0 {
                state.refuse_connects -= 1;
                return Err(StreamError::TransportConnect {
                    endpoint: endpoint.url(),
                    message: "connection refused".to_string(),
                });
            }
            state.connected = true;
        }
        self.emit(&TransportEvent::Connected);
        Ok(())
    }

    fn send_binary(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_send(true)?;
        let dropped = {
            let mut state = self.state.lock();
            state.sent_binary.push(bytes.to_vec());
            match state.drop_after_sends {
                Some(n) if state.sent_binary.len() >= n => {
                    state.drop_after_sends = None;
                    state.connected = false;
                    true
                }
                _ => false,
            }
        };
        if dropped {
            self.emit(&TransportEvent::Disconnected);
        }
        Ok(())
    }

    fn send_text(&mut self, text: &str) -> Result<()> {
        self.check_send(false)?;
        self.state.lock().sent_text.push(text.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn set_event_handler(&mut self, handler: EventHandler) {
        self.state.lock().handler = Some(handler);
    }

    fn close(&mut self) {
        let was_connected = std::mem::replace(&mut self.state.lock().connected, false);
        if was_connected {
            self.emit(&TransportEvent::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new("127.0.0.1", 8080, "esp32")
    }

    #[test]
    fn test_endpoint_url_normalizes_path() {
        assert_eq!(endpoint().url(), "ws://127.0.0.1:8080/esp32");
        assert_eq!(Endpoint::new("h", 1, "/x").to_string(), "ws://h:1/x");
    }

    #[test]
    fn test_mock_refuses_then_connects() {
        let mut transport = MockTransport::new().with_refused_connects(2);
        assert!(transport.connect(&endpoint(), Duration::ZERO).is_err());
        assert!(transport.connect(&endpoint(), Duration::ZERO).is_err());
        assert!(transport.connect(&endpoint(), Duration::ZERO).is_ok());
        assert!(transport.is_connected());
        assert_eq!(transport.connect_attempts(), 3);
    }

    #[test]
    fn test_mock_records_sends_and_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let mut transport = MockTransport::new();
        transport.set_event_handler(Box::new(move |e| sink.lock().push(e.clone())));

        transport.connect(&endpoint(), Duration::ZERO).unwrap();
        transport.send_text("hello").unwrap();
        transport.send_binary(&[1, 2, 3]).unwrap();
        transport.drop_connection();

        assert_eq!(transport.sent_text(), vec!["hello".to_string()]);
        assert_eq!(transport.sent_binary(), vec![vec![1, 2, 3]]);
        assert_eq!(
            *events.lock(),
            vec![TransportEvent::Connected, TransportEvent::Disconnected]
        );
    }

    #[test]
    fn test_mock_counts_sends_while_disconnected() {
        let mut transport = MockTransport::new();
        assert!(matches!(
            transport.send_binary(&[0]),
            Err(StreamError::NotConnected)
        ));
        assert_eq!(transport.sends_while_disconnected(), 1);
    }

    #[test]
    fn test_mock_drops_after_sends() {
        let mut transport = MockTransport::new().with_drop_after(2);
        transport.connect(&endpoint(), Duration::ZERO).unwrap();
        transport.send_binary(&[1]).unwrap();
        assert!(transport.is_connected());
        transport.send_binary(&[2]).unwrap();
        assert!(!transport.is_connected());
    }
}
