//! Transport Layer
//!
//! The connection manager and the sockets it drives.
//!
//! - `traits`: socket abstraction the manager is written against
//! - `manager`: connect, heartbeat, reconnect with backoff
//! - `memory`: in-process sockets for embedding and tests
//! - `websocket`: tokio-tungstenite connector (feature `websocket`)

pub mod backoff;
pub mod config;
pub mod manager;
pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use backoff::ReconnectBackoff;
pub use config::ConnectionConfig;
pub use manager::{ConnectError, ConnectionEvent, ConnectionManager, ConnectionStatus};
pub use memory::{ConnectPlan, MemoryConnector, MemoryPeer, MemoryServer, PeerFrame};
pub use traits::{FrameSocket, SocketConnector, SocketFrame, TransportError, NORMAL_CLOSURE};

#[cfg(feature = "websocket")]
pub use websocket::{WsConnector, WsSocket};
