// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The single outbound session to the collector.
//!
//! [`ConnectionManager::run`] owns the websocket, the pending emission FIFO and
//! the reconnect loop. Producers never touch the session directly, they hold a
//! [`DeferredEmitter`] that feeds this task through a bounded channel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::emitter::{DeferredEmitter, Emission, PendingEmissions};
use crate::error::TransportError;
use crate::identity::IdentitySource;
use crate::protocol::{self, Frame, Handshake};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;
pub const DEFAULT_PENDING_CAPACITY: usize = 10_000;
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Delay between reconnect attempts: exponential, capped, with randomized spread.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Fraction in `[0, 1]` of the delay that may be added or removed at random.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: 0.5,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial.as_millis() as f64 * 2f64.powi(attempt.min(31) as i32);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let millis = if jitter > 0.0 {
            let deviation = (fastrand::f64() * jitter * base).floor();
            if fastrand::bool() {
                base - deviation
            } else {
                base + deviation
            }
        } else {
            base
        };
        Duration::from_millis(millis.min(self.max.as_millis() as f64) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Collector base url, e.g. `https://log.example.com:3006`.
    pub server: String,
    pub reconnect: ReconnectPolicy,
    pub handshake_timeout: Duration,
    pub channel_capacity: usize,
    pub pending_capacity: usize,
}

impl ConnectionConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            reconnect: ReconnectPolicy::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
        }
    }
}

/// Opens raw text sessions. Implemented over websockets in production.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn Session>, TransportError>;
}

/// A bidirectional channel of text frames.
#[async_trait]
pub trait Session: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// `None` once the peer has closed the session.
    async fn next_text(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn Session>, TransportError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        Ok(Box::new(WebSocketSession { stream }))
    }
}

struct WebSocketSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Session for WebSocketSession {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    async fn next_text(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                Ok(WsMessage::Close(_)) => return None,
                // Control frames are answered by tungstenite itself
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::WebSocket(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("TRANSPORT | Error while closing websocket: {e}");
        }
    }
}

enum SessionEnd {
    Cancelled,
    Lost(TransportError),
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    identity: Arc<dyn IdentitySource>,
    connector: Arc<dyn Connector>,
    rx: mpsc::Receiver<Emission>,
    state_tx: watch::Sender<ConnectionState>,
    pending: PendingEmissions,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        identity: Arc<dyn IdentitySource>,
        connector: Arc<dyn Connector>,
        cancel: CancellationToken,
    ) -> (Self, DeferredEmitter) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let pending = PendingEmissions::new(config.pending_capacity);
        let manager = Self {
            config,
            identity,
            connector,
            rx,
            state_tx,
            pending,
            cancel,
        };
        (manager, DeferredEmitter::new(tx, state_rx))
    }

    pub async fn run(mut self) {
        let url = protocol::endpoint_url(&self.config.server);
        info!("TRANSPORT | Connection manager started for {url}");
        let mut attempt: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);
            // host and ip may have changed since the last attempt
            let identity = self.identity.resolve();
            let connect = establish(
                Arc::clone(&self.connector),
                url.clone(),
                identity,
                self.config.handshake_timeout,
            );
            let Some(result) = self.buffer_until(connect).await else {
                break;
            };

            match result {
                Ok((session, handshake)) => {
                    attempt = 0;
                    info!(
                        "TRANSPORT | Connected to collector sid={} pending={}",
                        handshake.sid,
                        self.pending.len()
                    );
                    self.set_state(ConnectionState::Connected);
                    let end = self.serve(session, &handshake).await;
                    self.set_state(ConnectionState::Disconnected);
                    match end {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Lost(e) => warn!("TRANSPORT | Connection lost: {e}"),
                    }
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    warn!("TRANSPORT | Connect attempt {} failed: {e}", attempt + 1);
                }
            }

            let delay = self.config.reconnect.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!("TRANSPORT | Reconnecting in {} ms", delay.as_millis());
            if self.buffer_until(sleep(delay)).await.is_none() {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        if !self.pending.is_empty() {
            info!(
                "TRANSPORT | Shutting down with {} undelivered emissions",
                self.pending.len()
            );
        }
        debug!("TRANSPORT | Connection manager stopped");
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Drives `fut` to completion while parking incoming emissions for the next
    /// connect. `None` when cancelled first.
    async fn buffer_until<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                output = &mut fut => return Some(output),
                Some(emission) = self.rx.recv() => self.pending.push(emission),
            }
        }
    }

    async fn serve(&mut self, mut session: Box<dyn Session>, handshake: &Handshake) -> SessionEnd {
        let window = handshake.liveness_window();

        while let Some(emission) = self.pending.pop_front() {
            if let Err(e) = write_emission(session.as_mut(), &emission).await {
                return SessionEnd::Lost(e);
            }
        }

        let mut deadline = Instant::now() + window;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    if let Err(e) = session.send_text(protocol::DISCONNECT.to_string()).await {
                        debug!("TRANSPORT | Could not send disconnect: {e}");
                    }
                    session.close().await;
                    return SessionEnd::Cancelled;
                }
                _ = sleep_until(deadline) => {
                    session.close().await;
                    return SessionEnd::Lost(TransportError::PingTimeout(window));
                }
                inbound = session.next_text() => {
                    let text = match inbound {
                        Some(Ok(text)) => text,
                        Some(Err(e)) => return SessionEnd::Lost(e),
                        None => return SessionEnd::Lost(TransportError::Closed),
                    };
                    deadline = Instant::now() + window;
                    match protocol::decode(&text) {
                        Ok(Frame::Ping) => {
                            if let Err(e) = session.send_text(protocol::PONG.to_string()).await {
                                return SessionEnd::Lost(e);
                            }
                        }
                        Ok(Frame::Close) | Ok(Frame::Disconnect) => {
                            return SessionEnd::Lost(TransportError::Closed);
                        }
                        Ok(Frame::Event { name, .. }) => {
                            debug!("TRANSPORT | Ignoring inbound event '{name}'");
                        }
                        Ok(_) => {}
                        Err(e) => debug!("TRANSPORT | Dropping malformed frame: {e}"),
                    }
                }
                Some(emission) = self.rx.recv() => {
                    if let Err(e) = write_emission(session.as_mut(), &emission).await {
                        return SessionEnd::Lost(e);
                    }
                }
            }
        }
    }
}

async fn establish(
    connector: Arc<dyn Connector>,
    url: String,
    identity: crate::identity::AuthIdentity,
    handshake_timeout: Duration,
) -> Result<(Box<dyn Session>, Handshake), TransportError> {
    let mut session = connector.open(&url).await?;
    let outcome = timeout(handshake_timeout, handshake(session.as_mut(), &identity)).await;
    match outcome {
        Ok(Ok(handshake)) => Ok((session, handshake)),
        Ok(Err(e)) => {
            session.close().await;
            Err(e)
        }
        Err(_) => {
            session.close().await;
            Err(TransportError::HandshakeTimeout(handshake_timeout))
        }
    }
}

async fn handshake(
    session: &mut dyn Session,
    identity: &crate::identity::AuthIdentity,
) -> Result<Handshake, TransportError> {
    let open = loop {
        match next_frame(session).await? {
            Frame::Open(open) => break open,
            other => debug!("TRANSPORT | Ignoring {other:?} before open"),
        }
    };

    session
        .send_text(protocol::connect_packet(identity)?)
        .await?;

    loop {
        match next_frame(session).await? {
            Frame::Connected { .. } => return Ok(open),
            Frame::ConnectError(message) => return Err(TransportError::Rejected(message)),
            Frame::Ping => session.send_text(protocol::PONG.to_string()).await?,
            Frame::Close | Frame::Disconnect => return Err(TransportError::Closed),
            _ => {}
        }
    }
}

async fn next_frame(session: &mut dyn Session) -> Result<Frame, TransportError> {
    match session.next_text().await {
        Some(Ok(text)) => Ok(protocol::decode(&text)?),
        Some(Err(e)) => Err(e),
        None => Err(TransportError::Closed),
    }
}

// The emission is consumed before the write; a failed write is not retried.
async fn write_emission(
    session: &mut dyn Session,
    emission: &Emission,
) -> Result<(), TransportError> {
    let packet = match protocol::event_packet(&emission.event, &emission.payload) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("TRANSPORT | Could not encode '{}': {e}", emission.event);
            return Ok(());
        }
    };
    session.send_text(packet).await.map_err(|e| {
        warn!("TRANSPORT | Write of '{}' failed, dropping it", emission.event);
        e
    })
}
