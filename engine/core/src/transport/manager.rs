//! Connection Manager
//!
//! Owns the one live socket: opening it, keeping it alive, and reopening it
//! after a drop.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   commands    ┌──────────────────────────────┐
//! │  ConnectionManager   │──────────────►│         driver task          │
//! │ connect / send /     │  Send/Shutdown│ select! {                    │
//! │ disconnect / status  │               │   socket.recv()  → parse     │
//! └──────────┬───────────┘               │   commands.recv() → write    │
//!            │ status (RwLock)           │   heartbeat.tick() → ping    │
//!            ▼                           │ }                            │
//!     ConnectionStatus ◄─────────────────│ drop → backoff → reconnect   │
//!                                        └──────────────┬───────────────┘
//!                                                       │ ConnectionEvent
//!                                                       ▼
//!                                                     Engine
//! ```
//!
//! The driver task is the only place the socket lives; everything else talks
//! to it over channels.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};

use super::backoff::ReconnectBackoff;
use super::config::ConnectionConfig;
use super::traits::{FrameSocket, SocketConnector, SocketFrame, TransportError, NORMAL_CLOSURE};
use crate::events::{parse_frame, ClientFrame, ServerEvent};

// ============================================================================
// Public Types
// ============================================================================

/// Connection lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No socket and nothing scheduled
    Disconnected,
    /// Opening a socket, or waiting out a backoff before reopening one
    Connecting,
    /// Socket open
    Connected,
}

/// Errors surfaced by the connection manager
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The socket did not open within the connect timeout
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The transport refused the connection
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Reconnection gave up after the configured number of attempts
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted {
        /// Attempts made before giving up
        attempts: u32,
    },
}

/// Events reported by the connection manager
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    /// A socket opened (initially or after a reconnect)
    Connected,
    /// The socket closed
    Disconnected {
        /// Close code, if one was received
        code: Option<u16>,
        /// Close reason
        reason: String,
    },
    /// A parsed inbound frame
    Message(ServerEvent),
    /// Terminal error; the manager has stopped
    Error(ConnectError),
    /// A reconnect attempt will start after `delay`
    ReconnectScheduled {
        /// Attempt number, starting at 1
        attempt: u32,
        /// Wait before the attempt
        delay: Duration,
    },
}

enum Command {
    Send(String),
    Shutdown,
}

// ============================================================================
// Manager
// ============================================================================

/// Socket lifecycle owner
///
/// Construct one per engine; nothing about it is global.
pub struct ConnectionManager<C: SocketConnector> {
    connector: Arc<C>,
    config: ConnectionConfig,
    status: Arc<RwLock<ConnectionStatus>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    driver: Option<JoinHandle<()>>,
}

impl<C: SocketConnector> ConnectionManager<C> {
    /// Create a manager and the receiver for its events
    pub fn new(
        connector: C,
        config: ConnectionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            connector: Arc::new(connector),
            config,
            status: Arc::new(RwLock::new(ConnectionStatus::Disconnected)),
            events,
            commands: None,
            driver: None,
        };
        (manager, events_rx)
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    /// Whether the socket is open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// The configuration in use
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Open the socket
    ///
    /// A no-op while already connecting or connected, including while a
    /// reconnect is pending.
    ///
    /// # Errors
    ///
    /// [`ConnectError::Timeout`] if the socket does not open within the
    /// connect timeout, [`ConnectError::Transport`] if it is refused.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        {
            let mut status = self.status.write();
            if *status != ConnectionStatus::Disconnected {
                tracing::debug!(status = ?*status, "connect() ignored, already active");
                return Ok(());
            }
            *status = ConnectionStatus::Connecting;
        }

        let socket = match open(&*self.connector, &self.config).await {
            Ok(socket) => socket,
            Err(e) => {
                *self.status.write() = ConnectionStatus::Disconnected;
                tracing::warn!(url = %self.config.url, error = %e, "Connection failed");
                return Err(e);
            }
        };

        *self.status.write() = ConnectionStatus::Connected;
        tracing::info!(url = %self.config.url, "Connected");
        let _ = self.events.send(ConnectionEvent::Connected);

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            connector: Arc::clone(&self.connector),
            config: self.config.clone(),
            status: Arc::clone(&self.status),
            events: self.events.clone(),
            commands: commands_rx,
            backoff: ReconnectBackoff::new(
                self.config.reconnect_base_delay(),
                self.config.max_reconnect_attempts,
            ),
        };
        self.commands = Some(commands);
        self.driver = Some(tokio::spawn(driver.run(socket)));
        Ok(())
    }

    /// Close the socket with a normal-closure code
    ///
    /// Cancels the heartbeat and any pending reconnect. Safe to call when
    /// already disconnected.
    pub async fn disconnect(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(Command::Shutdown);
        }
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                tracing::warn!(error = %e, "Connection driver ended abnormally");
            }
        }
        *self.status.write() = ConnectionStatus::Disconnected;
    }

    /// Send a frame on the open socket
    ///
    /// # Errors
    ///
    /// [`TransportError::NotConnected`] unless the socket is open.
    pub fn send(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let text = frame
            .to_text()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.commands
            .as_ref()
            .ok_or(TransportError::NotConnected)?
            .send(Command::Send(text))
            .map_err(|_| TransportError::NotConnected)
    }
}

async fn open<C: SocketConnector>(
    connector: &C,
    config: &ConnectionConfig,
) -> Result<C::Socket, ConnectError> {
    let timeout = config.connect_timeout();
    match tokio::time::timeout(timeout, connector.connect(&config.url)).await {
        Ok(Ok(socket)) => Ok(socket),
        Ok(Err(e)) => Err(ConnectError::Transport(e)),
        Err(_) => Err(ConnectError::Timeout(timeout)),
    }
}

// ============================================================================
// Driver Task
// ============================================================================

enum SessionEnd {
    Shutdown,
    Closed { code: Option<u16>, reason: String },
}

struct Driver<C: SocketConnector> {
    connector: Arc<C>,
    config: ConnectionConfig,
    status: Arc<RwLock<ConnectionStatus>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    backoff: ReconnectBackoff,
}

impl<C: SocketConnector> Driver<C> {
    async fn run(mut self, mut socket: C::Socket) {
        loop {
            match self.serve(&mut socket).await {
                SessionEnd::Shutdown => {
                    self.finish();
                    self.emit(ConnectionEvent::Disconnected {
                        code: Some(NORMAL_CLOSURE),
                        reason: "client disconnect".to_string(),
                    });
                    return;
                }
                SessionEnd::Closed { code, reason } => {
                    tracing::info!(code = ?code, reason = %reason, "Socket closed");
                    self.emit(ConnectionEvent::Disconnected {
                        code,
                        reason: reason.clone(),
                    });
                    if code == Some(NORMAL_CLOSURE) {
                        self.finish();
                        return;
                    }
                    *self.status.write() = ConnectionStatus::Connecting;
                }
            }

            match self.reconnect().await {
                Some(next) => socket = next,
                None => return,
            }
        }
    }

    /// Pump one open socket until it closes or a shutdown arrives
    async fn serve(&mut self, socket: &mut C::Socket) -> SessionEnd {
        let period = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let heartbeat_enabled = self.config.heartbeat_enabled && !period.is_zero();

        loop {
            tokio::select! {
                frame = socket.recv() => match frame {
                    Some(Ok(SocketFrame::Text(text))) => self.dispatch(&text),
                    Some(Ok(SocketFrame::Close { code, reason })) => {
                        return SessionEnd::Closed { code, reason };
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Socket receive failed");
                        return SessionEnd::Closed { code: None, reason: e.to_string() };
                    }
                    None => {
                        return SessionEnd::Closed { code: None, reason: "stream ended".to_string() };
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Send(text)) => {
                        if let Err(e) = socket.send_text(text).await {
                            tracing::warn!(error = %e, "Socket send failed");
                            return SessionEnd::Closed { code: None, reason: e.to_string() };
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        if let Err(e) = socket.close(NORMAL_CLOSURE, "client disconnect").await {
                            tracing::debug!(error = %e, "Close frame not delivered");
                        }
                        return SessionEnd::Shutdown;
                    }
                },
                _ = heartbeat.tick(), if heartbeat_enabled => {
                    let ping = ClientFrame::Ping { timestamp: Utc::now().timestamp_millis() };
                    match ping.to_text() {
                        Ok(text) => {
                            if let Err(e) = socket.send_text(text).await {
                                tracing::warn!(error = %e, "Heartbeat send failed");
                                return SessionEnd::Closed { code: None, reason: e.to_string() };
                            }
                            tracing::trace!("Heartbeat sent");
                        }
                        Err(e) => tracing::warn!(error = %e, "Heartbeat encode failed"),
                    }
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match parse_frame(text) {
            Ok(event) => {
                tracing::trace!(kind = event.kind(), "Frame received");
                self.emit(ConnectionEvent::Message(event));
            }
            Err(e) => tracing::warn!(error = %e, "Dropping malformed frame"),
        }
    }

    /// Back off and reopen until a socket opens, the cap is hit, or a
    /// shutdown arrives
    async fn reconnect(&mut self) -> Option<C::Socket> {
        loop {
            let Some(delay) = self.backoff.next_delay() else {
                let attempts = self.backoff.attempts();
                tracing::error!(attempts, "Reconnect attempts exhausted");
                self.finish();
                self.emit(ConnectionEvent::Error(ConnectError::ReconnectExhausted { attempts }));
                return None;
            };
            let attempt = self.backoff.attempts();
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
            self.emit(ConnectionEvent::ReconnectScheduled { attempt, delay });

            if self.interruptible(tokio::time::sleep(delay)).await.is_none() {
                self.shutdown_while_down();
                return None;
            }

            let connector = Arc::clone(&self.connector);
            let config = self.config.clone();
            match self.interruptible(open(&*connector, &config)).await {
                None => {
                    self.shutdown_while_down();
                    return None;
                }
                Some(Ok(socket)) => {
                    self.backoff.reset();
                    *self.status.write() = ConnectionStatus::Connected;
                    tracing::info!(attempt, "Reconnected");
                    self.emit(ConnectionEvent::Connected);
                    return Some(socket);
                }
                Some(Err(e)) => {
                    tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
                }
            }
        }
    }

    /// Run `fut` unless a shutdown arrives first
    ///
    /// Frames sent while the socket is down are dropped.
    async fn interruptible<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return Some(output),
                command = self.commands.recv() => match command {
                    Some(Command::Send(_)) => {
                        tracing::warn!("Dropping outbound frame while reconnecting");
                    }
                    Some(Command::Shutdown) | None => return None,
                },
            }
        }
    }

    fn shutdown_while_down(&self) {
        tracing::info!("Reconnect cancelled by disconnect");
        self.finish();
    }

    fn finish(&self) {
        *self.status.write() = ConnectionStatus::Disconnected;
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}
