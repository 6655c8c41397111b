//! In-Process Transport
//!
//! Channel-backed sockets for embedding the engine next to an in-process
//! server and for driving it from tests. Every `connect()` consumes the next
//! scripted [`ConnectPlan`] (accepting when none is queued) and hands the
//! server side of an accepted socket to [`MemoryServer::accept`].

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::traits::{FrameSocket, SocketConnector, SocketFrame, TransportError};

/// What the next connection attempt does
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectPlan {
    /// Open a socket
    Accept,
    /// Fail with the given reason
    Refuse(String),
    /// Never complete
    Hang,
}

/// A frame written by the client side
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerFrame {
    /// Text frame
    Text(String),
    /// The client closed the socket
    Close {
        /// Close code
        code: u16,
        /// Close reason
        reason: String,
    },
}

#[derive(Default)]
struct ConnectorState {
    plans: VecDeque<ConnectPlan>,
    attempts: usize,
}

/// Connector producing in-process sockets
#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<ConnectorState>>,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

/// Server half of a [`MemoryConnector`]
pub struct MemoryServer {
    state: Arc<Mutex<ConnectorState>>,
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryConnector {
    /// Create a connector and the server that receives its sockets
    #[must_use]
    pub fn new() -> (Self, MemoryServer) {
        let state = Arc::new(Mutex::new(ConnectorState::default()));
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::clone(&state),
                peers: peers_tx,
            },
            MemoryServer {
                state,
                peers: peers_rx,
            },
        )
    }

    /// Queue the behavior of a future connection attempt
    pub fn script(&self, plan: ConnectPlan) {
        self.state.lock().plans.push_back(plan);
    }
}

impl MemoryServer {
    /// Wait for the next accepted socket
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    /// Connection attempts made so far
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }
}

#[async_trait]
impl SocketConnector for MemoryConnector {
    type Socket = MemorySocket;

    async fn connect(&self, url: &str) -> Result<Self::Socket, TransportError> {
        let plan = {
            let mut state = self.state.lock();
            state.attempts += 1;
            state.plans.pop_front().unwrap_or(ConnectPlan::Accept)
        };

        match plan {
            ConnectPlan::Accept => {
                let (to_client, incoming) = mpsc::unbounded_channel();
                let (outgoing, from_client) = mpsc::unbounded_channel();
                self.peers
                    .send(MemoryPeer {
                        to_client,
                        from_client,
                    })
                    .map_err(|_| TransportError::ConnectionFailed("server dropped".to_string()))?;
                tracing::trace!(url, "In-process socket opened");
                Ok(MemorySocket { incoming, outgoing })
            }
            ConnectPlan::Refuse(reason) => Err(TransportError::ConnectionFailed(reason)),
            ConnectPlan::Hang => std::future::pending().await,
        }
    }
}

/// Client side of an in-process socket
pub struct MemorySocket {
    incoming: mpsc::UnboundedReceiver<SocketFrame>,
    outgoing: mpsc::UnboundedSender<PeerFrame>,
}

#[async_trait]
impl FrameSocket for MemorySocket {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.outgoing
            .send(PeerFrame::Text(text))
            .map_err(|_| TransportError::SendFailed("peer gone".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<SocketFrame, TransportError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.outgoing
            .send(PeerFrame::Close {
                code,
                reason: reason.to_string(),
            })
            .map_err(|_| TransportError::CloseFailed("peer gone".to_string()))
    }
}

/// Server side of an in-process socket
///
/// Dropping the peer ends the client's stream without a close frame, which
/// the connection manager treats as an abnormal drop.
pub struct MemoryPeer {
    to_client: mpsc::UnboundedSender<SocketFrame>,
    from_client: mpsc::UnboundedReceiver<PeerFrame>,
}

impl MemoryPeer {
    /// Push a text frame to the client
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(SocketFrame::Text(text.into())).is_ok()
    }

    /// Push a JSON value to the client
    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Close the socket from the server side
    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.to_client
            .send(SocketFrame::Close {
                code: Some(code),
                reason: reason.to_string(),
            })
            .is_ok()
    }

    /// Next frame written by the client
    pub async fn recv(&mut self) -> Option<PeerFrame> {
        self.from_client.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_accept_and_exchange() {
        let (connector, mut server) = MemoryConnector::new();
        let mut socket = connector.connect("mem://").await.unwrap();
        let mut peer = server.accept().await.unwrap();

        assert!(peer.send_text("hello"));
        assert_eq!(socket.recv().await, Some(Ok(SocketFrame::Text("hello".into()))));

        socket.send_text("world".into()).await.unwrap();
        assert_eq!(peer.recv().await, Some(PeerFrame::Text("world".into())));
        assert_eq!(server.attempts(), 1);
    }

    #[tokio::test]
    async fn test_refused_plan() {
        let (connector, _server) = MemoryConnector::new();
        connector.script(ConnectPlan::Refuse("nope".into()));
        assert!(matches!(
            connector.connect("mem://").await,
            Err(TransportError::ConnectionFailed(reason)) if reason == "nope"
        ));
    }

    #[tokio::test]
    async fn test_dropped_peer_ends_stream() {
        let (connector, mut server) = MemoryConnector::new();
        let mut socket = connector.connect("mem://").await.unwrap();
        drop(server.accept().await);
        assert_eq!(socket.recv().await, None);
    }
}
