//! Transport Traits
//!
//! The connection manager talks to the network through two small traits so
//! tests can swap the websocket for a scripted socket:
//! - `SocketConnector`: opens a socket for a URL
//! - `FrameSocket`: one open socket, text frames in and out

use std::fmt;

use async_trait::async_trait;

/// Close code for an intentional, graceful shutdown
///
/// A close with this code never triggers a reconnect.
pub const NORMAL_CLOSURE: u16 = 1000;

/// A frame received from the socket
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketFrame {
    /// A text frame
    Text(String),
    /// The peer closed the socket
    Close {
        /// Close code, if the peer sent one
        code: Option<u16>,
        /// Close reason
        reason: String,
    },
}

/// Errors that can occur during transport operations
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// Opening the socket failed
    ConnectionFailed(String),
    /// The socket is not open
    NotConnected,
    /// Failed to send a frame
    SendFailed(String),
    /// Failed to receive a frame
    ReceiveFailed(String),
    /// Failed to close the socket cleanly
    CloseFailed(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::NotConnected => write!(f, "Not connected"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::ReceiveFailed(msg) => write!(f, "Receive failed: {msg}"),
            Self::CloseFailed(msg) => write!(f, "Close failed: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// One open socket
///
/// `recv` must be cancel-safe: the connection driver polls it inside
/// `tokio::select!` next to its command channel and heartbeat timer.
#[async_trait]
pub trait FrameSocket: Send + 'static {
    /// Send a text frame
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Receive the next frame, `None` once the stream has ended
    async fn recv(&mut self) -> Option<Result<SocketFrame, TransportError>>;

    /// Close the socket with the given code
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// Opens sockets
#[async_trait]
pub trait SocketConnector: Send + Sync + 'static {
    /// Socket type produced by this connector
    type Socket: FrameSocket;

    /// Open a socket to `url`
    async fn connect(&self, url: &str) -> Result<Self::Socket, TransportError>;
}
