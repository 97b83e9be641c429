//! WebSocket client transport.
//!
//! Runs a private current-thread tokio runtime so the sender thread can drive
//! an async socket through blocking calls.

use super::{Endpoint, EventHandler, Transport, TransportEvent};
use crate::error::{Result, StreamError};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `poll` lets the runtime service the socket.
const POLL_WINDOW: Duration = Duration::from_millis(1);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WsTransport {
    runtime: Runtime,
    socket: Option<WsStream>,
    handler: Option<EventHandler>,
    send_timeout: Duration,
}

impl WsTransport {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StreamError::Spawn {
                task: "transport runtime".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            runtime,
            socket: None,
            handler: None,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        })
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    fn emit(&mut self, event: TransportEvent) {
        if let Some(handler) = self.handler.as_mut() {
            handler(&event);
        }
    }

    fn drop_link(&mut self, reason: &str) {
        if self.socket.take().is_some() {
            info!(reason, "connection closed");
            self.emit(TransportEvent::Disconnected);
        }
    }

    fn send_message(&mut self, message: Message) -> Result<()> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(StreamError::NotConnected);
        };
        let send_timeout = self.send_timeout;
        let outcome = self
            .runtime
            .block_on(async { tokio::time::timeout(send_timeout, socket.send(message)).await });

        let message = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("send timed out after {}ms", send_timeout.as_millis()),
        };
        self.emit(TransportEvent::Error(message.clone()));
        self.drop_link("send failed");
        Err(StreamError::TransportSend { message })
    }
}

impl Transport for WsTransport {
    fn connect(&mut self, endpoint: &Endpoint, timeout: Duration) -> Result<()> {
        self.close();
        let url = endpoint.url();
        debug!(endpoint = %url, "connecting");

        let (socket, _response) = self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, connect_async(url.as_str())).await })
            .map_err(|_| StreamError::TransportConnect {
                endpoint: url.clone(),
                message: format!("timed out after {}ms", timeout.as_millis()),
            })?
            .map_err(|e| StreamError::TransportConnect {
                endpoint: url.clone(),
                message: e.to_string(),
            })?;

        self.socket = Some(socket);
        info!(endpoint = %url, "connected");
        self.emit(TransportEvent::Connected);
        Ok(())
    }

    fn send_binary(&mut self, bytes: &[u8]) -> Result<()> {
        self.send_message(Message::Binary(bytes.to_vec()))
    }

    fn send_text(&mut self, text: &str) -> Result<()> {
        self.send_message(Message::Text(text.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    fn set_event_handler(&mut self, handler: EventHandler) {
        self.handler = Some(handler);
    }

    fn poll(&mut self) {
        loop {
            let Some(socket) = self.socket.as_mut() else {
                return;
            };
            let next = self
                .runtime
                .block_on(async { tokio::time::timeout(POLL_WINDOW, socket.next()).await });
            match next {
                Err(_) => return,
                Ok(None) => {
                    self.drop_link("stream ended");
                    return;
                }
                Ok(Some(Ok(Message::Text(text)))) => {
                    debug!(%text, "text from receiver");
                    self.emit(TransportEvent::Text(text));
                }
                Ok(Some(Ok(Message::Close(frame)))) => {
                    debug!(?frame, "close frame");
                    self.drop_link("closed by receiver");
                    return;
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "websocket read error");
                    self.emit(TransportEvent::Error(e.to_string()));
                    self.drop_link("read error");
                    return;
                }
            }
        }
    }

    fn close(&mut self) {
        if let Some(socket) = self.socket.as_mut() {
            let closed = self
                .runtime
                .block_on(async { tokio::time::timeout(CLOSE_TIMEOUT, socket.close(None)).await });
            if let Ok(Err(e)) = closed {
                debug!(error = %e, "close handshake failed");
            }
        }
        self.drop_link("closed locally");
    }
}
