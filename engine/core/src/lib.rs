//! Streamsync Core - Token Streaming and Conversation Sync
//!
//! Keeps a chat client's view of in-flight model responses and of its
//! conversations consistent with the server, over an unreliable websocket
//! and an eventually-consistent REST backend.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         UI collaborators                          │
//! │                 (render EngineEvent, call Engine)                 │
//! └─────────────────────────────────┬────────────────────────────────┘
//!                                   │
//! ┌─────────────────────────────────┼────────────────────────────────┐
//! │                          STREAMSYNC CORE                          │
//! │  ┌──────────────────────────────┴─────────────────────────────┐  │
//! │  │                           Engine                            │  │
//! │  │  ┌────────────┐  ┌──────────┐  ┌─────────┐  ┌────────────┐ │  │
//! │  │  │ Connection │  │ Session  │  │ Token   │  │Conversation│ │  │
//! │  │  │  Manager   │─►│ Machine  │─►│ Batcher │─►│ Reconciler │ │  │
//! │  │  └─────┬──────┘  └──────────┘  └─────────┘  └─────┬──────┘ │  │
//! │  └────────┼───────────────────────────────────────────┼────────┘  │
//! └───────────┼───────────────────────────────────────────┼───────────┘
//!             ▼                                           ▼
//!        websocket                                  REST backend
//! ```
//!
//! # Key Types
//!
//! - [`Engine`]: wires the components and emits [`EngineEvent`]s
//! - [`ConnectionManager`]: socket lifecycle, heartbeat, reconnect backoff
//! - [`TokenBatcher`]: groups tokens per stream and paces delivery per frame
//! - [`SessionMachine`]: reasoning session lifecycle and answer routing
//! - [`ConversationReconciler`]: optimistic create, dedupe, titles, deletion
//!
//! # Quick Start
//!
//! ```ignore
//! use streamsync_core::{load_config, Engine, InMemoryBackend, WsConnector};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let (mut engine, mut events) = Engine::new(WsConnector, InMemoryBackend::new(), config);
//!     engine.connect().await?;
//!
//!     let conversation = engine.create_conversation();
//!     engine.send_user_message(&conversation, "Hello!").await?;
//!
//!     loop {
//!         engine.step().await;
//!         while let Ok(event) = events.try_recv() {
//!             println!("{event:?}");
//!         }
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod conversation;
pub mod engine;
pub mod events;
pub mod messages;
pub mod session;
pub mod streaming;
pub mod transport;

// Re-export main types for convenience
pub use engine::{Engine, EngineError, EngineInput};
pub use events::{parse_frame, ClientFrame, FrameError, ServerEvent};
pub use messages::{
    ConversationId, EngineEvent, Message, MessageId, MessageRole, SessionId,
};
pub use session::{ReasoningSession, SessionConfig, SessionEffect, SessionMachine, SessionMetrics};

// Streaming
pub use streaming::{BatchSink, BatchingConfig, PerformanceStats, TokenBatch, TokenBatcher};

// Transport
pub use transport::{
    ConnectError, ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionStatus,
    MemoryConnector, SocketConnector, TransportError,
};
#[cfg(feature = "websocket")]
pub use transport::WsConnector;

// Conversations
pub use conversation::{
    Appended, BackendError, Conversation, ConversationBackend, ConversationReconciler,
    HttpConversationBackend, InMemoryBackend, ReconcileError, ReconcilerConfig,
};

// Configuration
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, EngineConfig,
};
