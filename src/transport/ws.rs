//! Bidirectional WebSocket transport with auto-reconnect (C4, spec §4.4).
//!
//! State machine: `Disconnected → Connecting → Connected → (Reconnecting →
//! Connecting)* → Closed`. Transitions are guarded by [`parking_lot::Mutex`]
//! so only one task performs lifecycle changes at a time (spec §4.4).
//!
//! Grounded on `newheads-evm-provider::ethereum::EthereumClient::subscribe_newheads`
//! for the `connect_async` + split-sender/receiver + spawned-task shape,
//! generalized into a standalone transport with its own outgoing queue,
//! reconnect loop, and `onConnect`/`onDisconnect` callback hooks so the
//! subscription multiplexer (C5) never needs to reach into transport
//! internals (spec §9: cyclic references resolved via callbacks).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{EngineError, TransportError};

/// Connection lifecycle state (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    pub url: String,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub buffer_size: usize,
    pub handshake_timeout: Duration,
}

impl Default for WsTransportConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            buffer_size: 1024,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl WsTransportConfig {
    /// Reject configuration the connect/reconnect loop can't act on
    /// (spec §A.3).
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.url.is_empty() {
            return Err(EngineError::ConfigInvalid {
                reason: "websocket url must not be empty".to_string(),
            });
        }
        if self.ping_interval.is_zero() {
            return Err(EngineError::ConfigInvalid {
                reason: "ping_interval must be greater than zero".to_string(),
            });
        }
        if self.read_timeout.is_zero() {
            return Err(EngineError::ConfigInvalid {
                reason: "read_timeout must be greater than zero".to_string(),
            });
        }
        if self.write_timeout.is_zero() {
            return Err(EngineError::ConfigInvalid {
                reason: "write_timeout must be greater than zero".to_string(),
            });
        }
        if self.handshake_timeout.is_zero() {
            return Err(EngineError::ConfigInvalid {
                reason: "handshake_timeout must be greater than zero".to_string(),
            });
        }
        if self.buffer_size == 0 {
            return Err(EngineError::ConfigInvalid {
                reason: "buffer_size must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
}

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    state: Mutex<ConnectionState>,
    config: WsTransportConfig,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    incoming_tx: broadcast::Sender<String>,
    on_connect: Mutex<Vec<Callback>>,
    on_disconnect: Mutex<Vec<Callback>>,
    received: AtomicU32,
    sent: AtomicU32,
    reconnect_attempts: AtomicU32,
    last_error: Mutex<Option<String>>,
    connected_at: Mutex<Option<DateTime<Utc>>>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// A resilient WebSocket transport. Cheaply cloneable; all state lives
/// behind the shared [`Inner`].
#[derive(Clone)]
pub struct WsTransport {
    inner: Arc<Inner>,
}

impl WsTransport {
    pub fn new(config: WsTransportConfig) -> Self {
        let (incoming_tx, _) = broadcast::channel(config.buffer_size.max(16));
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ConnectionState::Disconnected),
                config,
                outbound: Mutex::new(None),
                incoming_tx,
                on_connect: Mutex::new(Vec::new()),
                on_disconnect: Mutex::new(Vec::new()),
                received: AtomicU32::new(0),
                sent: AtomicU32::new(0),
                reconnect_attempts: AtomicU32::new(0),
                last_error: Mutex::new(None),
                connected_at: Mutex::new(None),
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            messages_received: self.inner.received.load(Ordering::Relaxed) as u64,
            messages_sent: self.inner.sent.load(Ordering::Relaxed) as u64,
            reconnect_attempts: self.inner.reconnect_attempts.load(Ordering::Relaxed),
            last_error: self.inner.last_error.lock().clone(),
            connected_at: *self.inner.connected_at.lock(),
        }
    }

    /// Register a callback fired exactly once per transition into
    /// `Connected` (including after a reconnect).
    pub fn on_connect(&self, f: impl Fn() + Send + Sync + 'static) {
        self.inner.on_connect.lock().push(Arc::new(f));
    }

    /// Register a callback fired exactly once per transition out of
    /// `Connected`.
    pub fn on_disconnect(&self, f: impl Fn() + Send + Sync + 'static) {
        self.inner.on_disconnect.lock().push(Arc::new(f));
    }

    /// A broadcast receiver for every inbound text frame, unmarshalled
    /// only as far as the caller needs (the multiplexer decides how to
    /// parse it further). Each subscriber gets every message from the
    /// point they subscribe; a slow subscriber that lags is informed via
    /// `RecvError::Lagged` rather than silently blocking the read pump.
    pub fn subscribe_incoming(&self) -> broadcast::Receiver<String> {
        self.inner.incoming_tx.subscribe()
    }

    /// Dial the URL with a handshake timeout, then fork the read/write/
    /// ping pumps (spec §4.4). On success the transport is `Connected`
    /// and a supervisor task owns auto-reconnect for the rest of this
    /// transport's life.
    pub async fn connect(&self) -> Result<(), EngineError> {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Closed {
                return Err(TransportError::NotConnected {
                    url: self.inner.config.url.clone(),
                }
                .into());
            }
            *state = ConnectionState::Connecting;
        }

        self.dial_and_spawn_pumps().await?;

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { Self::supervise(inner).await });
        *self.inner.supervisor.lock() = Some(handle);

        Ok(())
    }

    async fn dial_and_spawn_pumps(&self) -> Result<(), EngineError> {
        let url = self.inner.config.url.clone();
        let dial = tokio::time::timeout(
            self.inner.config.handshake_timeout,
            tokio_tungstenite::connect_async(&url),
        )
        .await;

        let (stream, _response) = match dial {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                return Err(TransportError::DialFailed { url, source: e }.into());
            }
            Err(_) => {
                return Err(TransportError::HandshakeTimeout {
                    url,
                    timeout_secs: self.inner.config.handshake_timeout.as_secs(),
                }
                .into());
            }
        };

        let (ws_sender, ws_receiver) = stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(self.inner.config.buffer_size);
        *self.inner.outbound.lock() = Some(outbound_tx.clone());

        *self.inner.state.lock() = ConnectionState::Connected;
        *self.inner.connected_at.lock() = Some(Utc::now());
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        for cb in self.inner.on_connect.lock().iter() {
            cb();
        }

        let inner_read = self.inner.clone();
        tokio::spawn(Self::read_pump(inner_read, ws_receiver));

        let inner_write = self.inner.clone();
        tokio::spawn(Self::write_pump(inner_write, ws_sender, outbound_rx));

        let inner_ping = self.inner.clone();
        tokio::spawn(Self::ping_pump(inner_ping, outbound_tx));

        Ok(())
    }

    async fn read_pump(
        inner: Arc<Inner>,
        mut receiver: futures_util::stream::SplitStream<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
        >,
    ) {
        let read_timeout = inner.config.read_timeout;
        loop {
            let next = tokio::time::timeout(read_timeout, receiver.next()).await;
            match next {
                Ok(Some(Ok(Message::Text(text)))) => {
                    inner.received.fetch_add(1, Ordering::Relaxed);
                    if inner.incoming_tx.send(text).is_err() {
                        debug!("no active subscribers for incoming websocket messages");
                    }
                }
                Ok(Some(Ok(Message::Pong(_)))) => {
                    // any received frame (including Pong) implicitly
                    // resets the read-timeout window for the next loop
                    // iteration; nothing further to do.
                }
                Ok(Some(Ok(Message::Ping(_) | Message::Binary(_) | Message::Frame(_)))) => {}
                Ok(Some(Ok(Message::Close(_)))) => {
                    warn!("websocket closed by peer");
                    *inner.last_error.lock() = Some("closed by peer".to_string());
                    break;
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "websocket read error");
                    *inner.last_error.lock() = Some(e.to_string());
                    break;
                }
                Ok(None) => {
                    warn!("websocket stream ended");
                    break;
                }
                Err(_) => {
                    warn!("websocket read timed out");
                    *inner.last_error.lock() = Some("read timeout".to_string());
                    break;
                }
            }
        }
        Self::on_pump_exit(&inner);
    }

    async fn write_pump(
        inner: Arc<Inner>,
        mut sender: futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            Message,
        >,
        mut outbound_rx: mpsc::Receiver<Message>,
    ) {
        let write_timeout = inner.config.write_timeout;
        while let Some(msg) = outbound_rx.recv().await {
            let result = tokio::time::timeout(write_timeout, sender.send(msg)).await;
            match result {
                Ok(Ok(())) => {
                    inner.sent.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "websocket write error");
                    *inner.last_error.lock() = Some(e.to_string());
                    break;
                }
                Err(_) => {
                    warn!("websocket write timed out");
                    *inner.last_error.lock() = Some("write timeout".to_string());
                    break;
                }
            }
        }
        let _ = sender.send(Message::Close(None)).await;
        Self::on_pump_exit(&inner);
    }

    async fn ping_pump(inner: Arc<Inner>, outbound_tx: mpsc::Sender<Message>) {
        let mut interval = tokio::time::interval(inner.config.ping_interval);
        loop {
            interval.tick().await;
            if *inner.state.lock() != ConnectionState::Connected {
                break;
            }
            if outbound_tx.try_send(Message::Ping(Vec::new())).is_err() {
                debug!("ping pump: outbound queue unavailable, stopping");
                break;
            }
        }
    }

    /// Called by whichever pump (read or write) notices the connection
    /// is dead. Only the first caller performs the state transition; the
    /// `state` mutex makes this race-free.
    fn on_pump_exit(inner: &Arc<Inner>) {
        let mut state = inner.state.lock();
        if *state == ConnectionState::Connected {
            *state = ConnectionState::Reconnecting;
            drop(state);
            for cb in inner.on_disconnect.lock().iter() {
                cb();
            }
        }
    }

    async fn supervise(inner: Arc<Inner>) {
        loop {
            // wait until a pump has flagged reconnecting or closed
            loop {
                let state = *inner.state.lock();
                if state != ConnectionState::Connected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }

            if *inner.state.lock() == ConnectionState::Closed {
                return;
            }

            let transport = WsTransport {
                inner: inner.clone(),
            };

            let mut attempt = 0;
            let mut reconnected = false;
            while attempt < inner.config.max_reconnect_attempts {
                if *inner.state.lock() == ConnectionState::Closed {
                    return;
                }
                tokio::time::sleep(inner.config.reconnect_interval).await;
                attempt += 1;
                inner.reconnect_attempts.store(attempt, Ordering::SeqCst);
                info!(attempt, "attempting websocket reconnect");
                *inner.state.lock() = ConnectionState::Connecting;
                match transport.dial_and_spawn_pumps().await {
                    Ok(()) => {
                        reconnected = true;
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, attempt, "reconnect attempt failed");
                        *inner.last_error.lock() = Some(e.to_string());
                    }
                }
            }

            if !reconnected {
                warn!("exhausted reconnect attempts, transport disconnected");
                *inner.state.lock() = ConnectionState::Disconnected;
                return;
            }
            // loop back around to wait for the next disconnect
        }
    }

    /// Enqueue a text frame for the write pump. Non-blocking: fails fast
    /// with `NotConnected` or `BackpressureFull` rather than awaiting
    /// queue space (spec §4.4).
    pub async fn send_message(&self, text: String) -> Result<(), EngineError> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected {
                url: self.inner.config.url.clone(),
            }
            .into());
        }
        let sender = self.inner.outbound.lock().clone();
        match sender {
            Some(tx) => tx.try_send(Message::Text(text)).map_err(|_| {
                TransportError::BackpressureFull {
                    url: self.inner.config.url.clone(),
                }
                .into()
            }),
            None => Err(TransportError::NotConnected {
                url: self.inner.config.url.clone(),
            }
            .into()),
        }
    }

    /// Graceful shutdown: best-effort close frame, cancel the
    /// supervisor, mark `Closed`.
    pub async fn disconnect(&self) {
        *self.inner.state.lock() = ConnectionState::Closed;
        if let Some(tx) = self.inner.outbound.lock().clone() {
            let _ = tx.try_send(Message::Close(None));
        }
        if let Some(handle) = self.inner.supervisor.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_timeouts() {
        let cfg = WsTransportConfig::default();
        assert_eq!(cfg.handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn validate_rejects_empty_url() {
        let cfg = WsTransportConfig::default();
        assert!(matches!(
            cfg.validate(),
            Err(EngineError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn validate_accepts_populated_url() {
        let cfg = WsTransportConfig {
            url: "ws://localhost:8546".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[tokio::test]
    async fn send_message_without_connecting_is_not_connected() {
        let transport = WsTransport::new(WsTransportConfig {
            url: "ws://unused.invalid".to_string(),
            ..Default::default()
        });
        let result = transport.send_message("hi".to_string()).await;
        assert!(matches!(
            result,
            Err(EngineError::Transport(TransportError::NotConnected { .. }))
        ));
    }

    #[tokio::test]
    async fn connect_to_unreachable_url_fails_fast() {
        let transport = WsTransport::new(WsTransportConfig {
            url: "ws://127.0.0.1:1".to_string(),
            handshake_timeout: Duration::from_millis(200),
            ..Default::default()
        });
        let result = transport.connect().await;
        assert!(result.is_err());
        assert_ne!(transport.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn disconnect_marks_closed() {
        let transport = WsTransport::new(WsTransportConfig {
            url: "ws://unused.invalid".to_string(),
            ..Default::default()
        });
        transport.disconnect().await;
        assert_eq!(transport.state(), ConnectionState::Closed);
    }
}
