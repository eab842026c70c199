//! WebSocket transport with automatic reconnection.
//!
//! The [`Transport`] task owns the socket. It forwards every parsed inbound
//! frame, plus a [`TransportEvent::Connected`] / [`TransportEvent::Disconnected`]
//! marker per connection, on one ordered channel. Outbound frames go through
//! a [`TransportHandle`], which refuses writes while no connection is open.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Capacity of the inbound event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Errors raised by the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Transport task has shut down")]
    Closed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Something that can put a JSON frame on the wire.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: JsonValue) -> Result<(), TransportError>;
}

/// Connection lifecycle and inbound traffic, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A new connection is open; the handshake must be replayed.
    Connected,
    /// A parsed inbound frame.
    Message(JsonValue),
    /// The connection closed or failed.
    Disconnected { reason: String },
}

/// Exponential reconnect delay: doubles per failure, capped, reset on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record a failure: returns the delay to wait now and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

/// Cloneable write side of the transport.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    outbound_tx: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
}

impl TransportHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl FrameSink for TransportHandle {
    fn send_frame(&self, frame: JsonValue) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let text = serde_json::to_string(&frame)?;
        self.outbound_tx
            .send(text)
            .map_err(|_| TransportError::Closed)
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How a connection ended.
enum SessionEnd {
    Closed(String),
    Shutdown,
}

/// Reconnecting WebSocket task.
pub struct Transport {
    url: String,
    backoff: Backoff,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    events_tx: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
}

impl Transport {
    /// Create the transport, its write handle and the inbound event stream.
    /// Nothing connects until [`Transport::run`] is polled.
    pub fn new(
        url: impl Into<String>,
        backoff: Backoff,
    ) -> (Self, TransportHandle, mpsc::Receiver<TransportEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));

        let transport = Self {
            url: url.into(),
            backoff,
            outbound_rx,
            events_tx,
            connected: connected.clone(),
        };
        let handle = TransportHandle {
            outbound_tx,
            connected,
        };

        (transport, handle, events_rx)
    }

    /// Connect, pump frames, and reconnect forever. Returns once the event
    /// receiver or every handle has been dropped.
    pub async fn run(mut self) {
        loop {
            info!("Connecting to {}", self.url);

            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    info!("WebSocket connected");
                    self.backoff.reset();
                    self.discard_stale_frames();
                    self.connected.store(true, Ordering::SeqCst);

                    if self.events_tx.send(TransportEvent::Connected).await.is_err() {
                        return;
                    }

                    let end = self.run_session(ws).await;
                    self.connected.store(false, Ordering::SeqCst);

                    match end {
                        SessionEnd::Shutdown => return,
                        SessionEnd::Closed(reason) => {
                            info!("WebSocket closed ({})", reason);
                            let event = TransportEvent::Disconnected { reason };
                            if self.events_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("WebSocket error: {}", e);
                }
            }

            let delay = self.backoff.next_delay();
            info!("Reconnecting in {:.1}s", delay.as_secs_f64());
            tokio::time::sleep(delay).await;
        }
    }

    /// Frames queued for a connection that no longer exists are dropped.
    fn discard_stale_frames(&mut self) {
        let mut dropped = 0usize;
        while self.outbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("Discarded {} frame(s) queued before reconnect", dropped);
        }
    }

    async fn run_session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        let outbound_rx = &mut self.outbound_rx;
        let events_tx = &self.events_tx;

        loop {
            tokio::select! {
                incoming = read.next() => {
                    let json = match incoming {
                        Some(Ok(Message::Text(text))) => serde_json::from_str::<JsonValue>(&text),
                        Some(Ok(Message::Binary(bytes))) => serde_json::from_slice::<JsonValue>(&bytes),
                        Some(Ok(Message::Close(frame))) => {
                            let reason = match frame {
                                Some(frame) => format!("code={}, reason={}", frame.code, frame.reason),
                                None => "no close frame".to_string(),
                            };
                            return SessionEnd::Closed(reason);
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return SessionEnd::Closed(e.to_string()),
                        None => return SessionEnd::Closed("stream ended".to_string()),
                    };

                    match json {
                        Ok(json) => {
                            if events_tx.send(TransportEvent::Message(json)).await.is_err() {
                                let _ = write.close().await;
                                return SessionEnd::Shutdown;
                            }
                        }
                        Err(e) => warn!("Failed to parse WS message: {}", e),
                    }
                }

                outgoing = outbound_rx.recv() => {
                    match outgoing {
                        Some(text) => {
                            debug!(">>> {}", text);
                            if let Err(e) = write.send(Message::Text(text)).await {
                                return SessionEnd::Closed(e.to_string());
                            }
                        }
                        None => {
                            let _ = write.close().await;
                            return SessionEnd::Shutdown;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::accept_async;

    async fn next_event(events: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no transport event within 5s")
            .expect("event channel closed")
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let floor = Duration::from_secs(1);
        let ceiling = Duration::from_secs(60);
        let mut backoff = Backoff::new(floor, ceiling);

        for n in 0..10u32 {
            let expected = (floor * 2u32.pow(n)).min(ceiling);
            assert_eq!(backoff.current(), expected, "after {} failures", n);
            assert_eq!(backoff.next_delay(), expected);
        }
        assert_eq!(backoff.current(), ceiling);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_secs(8));

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(1));
    }

    #[test]
    fn test_handle_refuses_while_disconnected() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let (_transport, handle, _events) = Transport::new("ws://localhost:3000", backoff);

        let result = handle.send_frame(json!({"command": "start_listening"}));
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[test]
    fn test_stale_frames_discarded() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let (mut transport, handle, _events) = Transport::new("ws://localhost:3000", backoff);

        handle.connected.store(true, Ordering::SeqCst);
        handle.send_frame(json!({"command": "a"})).unwrap();
        handle.send_frame(json!({"command": "b"})).unwrap();

        transport.discard_stale_frames();
        assert!(transport.outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnects_after_close_and_skips_bad_json() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (received_tx, received_rx) = oneshot::channel();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            for text in [r#"{"type":"event","n":1}"#, "not json", r#"{"type":"event","n":2}"#] {
                ws.send(Message::Text(text.to_string())).await.unwrap();
            }
            ws.close(None).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                let _ = received_tx.send(text);
            }
        });

        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(50));
        let (transport, handle, mut events) = Transport::new(url, backoff);
        let task = tokio::spawn(transport.run());

        assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Message(json!({"type": "event", "n": 1}))
        );
        // The unparseable frame is skipped without ending the session.
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Message(json!({"type": "event", "n": 2}))
        );
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Disconnected { .. }
        ));
        assert!(!handle.is_connected());

        assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
        handle
            .send_frame(json!({"messageId": "1", "command": "start_listening"}))
            .unwrap();

        let text = tokio::time::timeout(Duration::from_secs(5), received_rx)
            .await
            .unwrap()
            .unwrap();
        let frame: JsonValue = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["command"], "start_listening");

        task.abort();
        server.abort();
    }
}
