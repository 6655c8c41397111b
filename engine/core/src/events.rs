//! Socket Wire Events
//!
//! Inbound frames are a JSON tagged union keyed by `type`. Several event kinds
//! arrive under more than one name (the server grew them over time), so each
//! variant lists its aliases and the rest of the engine only ever matches on
//! the canonical variant.
//!
//! ```text
//!   raw text ──► serde_json::Value ──► ServerEvent
//!                    │                     │
//!               FrameError::Malformed   FrameError::Schema
//! ```
//!
//! Unknown `type` values deserialize to [`ServerEvent::Unrecognized`] so a new
//! server event never tears down the stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messages::{ConversationId, MessageId, SessionId};

// ============================================================================
// Errors
// ============================================================================

/// Errors produced while decoding or encoding socket frames
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame is not valid JSON
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Valid JSON that does not match the event schema
    #[error("invalid '{kind}' frame: {source}")]
    Schema {
        /// The `type` field of the offending frame
        kind: String,
        /// Underlying decode error
        #[source]
        source: serde_json::Error,
    },

    /// An outbound frame could not be serialized
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

// ============================================================================
// Inbound
// ============================================================================

/// Events pushed by the server over the socket
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Handshake acknowledgement
    #[serde(alias = "connected")]
    ConnectionEstablished {
        /// Server-assigned client id, if any
        #[serde(default)]
        client_id: Option<String>,
    },

    /// A reasoning session (stream) began
    #[serde(rename = "session_start", alias = "reasoning_start", alias = "session_started")]
    SessionStarted {
        /// Stream identifier
        #[serde(alias = "stream_id")]
        session_id: SessionId,
        /// Owning conversation
        #[serde(default)]
        conversation_id: Option<ConversationId>,
    },

    /// Content delta carrying reasoning text, answer text, or both
    StreamChunk {
        /// Stream identifier
        #[serde(alias = "stream_id")]
        session_id: SessionId,
        /// Owning conversation
        #[serde(default)]
        conversation_id: Option<ConversationId>,
        /// Text for the reasoning trace
        #[serde(default, alias = "reasoning")]
        reasoning_content: Option<String>,
        /// Text for the visible answer
        #[serde(default, alias = "answer", alias = "answer_content")]
        content: Option<String>,
    },

    /// Single answer token (token streaming mode)
    Token {
        /// Stream identifier
        #[serde(alias = "stream_id")]
        session_id: SessionId,
        /// Owning conversation
        #[serde(default)]
        conversation_id: Option<ConversationId>,
        /// Token text
        token: String,
        /// Model that produced the token
        #[serde(default)]
        model: Option<String>,
        /// Provider serving the model
        #[serde(default)]
        provider: Option<String>,
    },

    /// A stream finished
    #[serde(
        rename = "stream_complete",
        alias = "reasoning_end",
        alias = "session_end",
        alias = "complete"
    )]
    StreamComplete {
        /// Stream identifier
        #[serde(alias = "stream_id")]
        session_id: SessionId,
        /// Owning conversation
        #[serde(default)]
        conversation_id: Option<ConversationId>,
    },

    /// Typing/status indicator
    #[serde(alias = "status")]
    Typing {
        /// Stream the indicator refers to
        #[serde(default, alias = "stream_id")]
        session_id: Option<SessionId>,
        /// Explicit typing flag
        #[serde(default, alias = "is_typing")]
        active: Option<bool>,
        /// Free-form status string
        #[serde(default)]
        status: Option<String>,
    },

    /// Server-side failure
    Error {
        /// Stream the error belongs to, if any
        #[serde(default, alias = "stream_id")]
        session_id: Option<SessionId>,
        /// Conversation the error belongs to, if any
        #[serde(default)]
        conversation_id: Option<ConversationId>,
        /// Error description
        #[serde(default, alias = "error")]
        message: String,
    },

    /// Pushed conversation title
    #[serde(alias = "conversation_title")]
    TitleUpdated {
        /// Conversation that was titled
        conversation_id: ConversationId,
        /// The new title
        title: String,
    },

    /// Application-level heartbeat reply
    Pong {
        /// Echoed timestamp
        #[serde(default)]
        timestamp: Option<i64>,
    },

    /// Any event type this client does not know
    #[serde(other)]
    Unrecognized,
}

impl ServerEvent {
    /// Short name for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::SessionStarted { .. } => "session_start",
            Self::StreamChunk { .. } => "stream_chunk",
            Self::Token { .. } => "token",
            Self::StreamComplete { .. } => "stream_complete",
            Self::Typing { .. } => "typing",
            Self::Error { .. } => "error",
            Self::TitleUpdated { .. } => "title_updated",
            Self::Pong { .. } => "pong",
            Self::Unrecognized => "unrecognized",
        }
    }

    /// Stream the event refers to
    #[must_use]
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::SessionStarted { session_id, .. }
            | Self::StreamChunk { session_id, .. }
            | Self::Token { session_id, .. }
            | Self::StreamComplete { session_id, .. } => Some(session_id),
            Self::Typing { session_id, .. } | Self::Error { session_id, .. } => {
                session_id.as_ref()
            }
            _ => None,
        }
    }
}

/// Decode one text frame
///
/// # Errors
///
/// [`FrameError::Malformed`] for non-JSON input, [`FrameError::Schema`] when
/// the JSON does not fit the event it names.
pub fn parse_frame(text: &str) -> Result<ServerEvent, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(FrameError::Malformed)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("<missing>")
        .to_string();

    let event = ServerEvent::deserialize(value)
        .map_err(|source| FrameError::Schema { kind: kind.clone(), source })?;

    if event == ServerEvent::Unrecognized {
        tracing::debug!(event_type = %kind, "Unrecognized server event");
    }
    Ok(event)
}

// ============================================================================
// Outbound
// ============================================================================

/// Frames the client sends to the server
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Keep-alive
    Ping {
        /// Client wall clock in unix milliseconds
        timestamp: i64,
    },

    /// A user message for the model
    Message {
        /// Target conversation
        conversation_id: ConversationId,
        /// Id of the stored user message
        message_id: MessageId,
        /// Message text
        content: String,
    },
}

impl ClientFrame {
    /// Serialize to the JSON text sent on the wire
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Encode`] if serialization fails.
    pub fn to_text(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(FrameError::Encode)
    }
}
