//! Engine Messages
//!
//! Identifiers, the message model, and the integration events the engine
//! emits to UI collaborators. Rendering is out of scope here: surfaces receive
//! [`EngineEvent`]s and draw whatever they like.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::SessionMetrics;

/// Prefix of locally generated conversation ids
pub const PLACEHOLDER_PREFIX: &str = "local-";

// ============================================================================
// Identifiers
// ============================================================================

/// Conversation identifier
///
/// Either a local placeholder (`local-<uuid>`) assigned at creation time, or
/// the canonical id handed out by the backend once creation is confirmed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Generate a new local placeholder id
    #[must_use]
    pub fn placeholder() -> Self {
        Self(format!("{PLACEHOLDER_PREFIX}{}", Uuid::new_v4()))
    }

    /// Whether this id was generated locally
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with(PLACEHOLDER_PREFIX)
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Message identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a new unique message ID
    #[must_use]
    pub fn new() -> Self {
        Self(format!("msg_{}", Uuid::new_v4().simple()))
    }

    /// The id of the assistant message a stream writes into
    #[must_use]
    pub fn for_stream(session_id: &SessionId) -> Self {
        Self(format!("stream_{}", session_id.0))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Reasoning session / stream identifier
///
/// A stream is one in-flight model response; the server tags every chunk of
/// it with the same session id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// Message Model
// ============================================================================

/// Who sent a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// User input
    User,
    /// Model response
    Assistant,
}

/// A message in a conversation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: MessageId,
    /// Who sent this message
    pub role: MessageRole,
    /// Message content
    pub content: String,
    /// When the message was created
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a new message stamped with the current time
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Replace the id
    #[must_use]
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    /// Replace the creation timestamp
    #[must_use]
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Whether `other` is a redelivery of this message
    ///
    /// Same id, or same role and content created within `window_ms` of each
    /// other.
    #[must_use]
    pub fn is_duplicate_of(&self, other: &Message, window_ms: i64) -> bool {
        if self.id == other.id {
            return true;
        }
        self.role == other.role
            && self.content == other.content
            && (self.created_at - other.created_at).num_milliseconds().abs() <= window_ms
    }
}

// ============================================================================
// Integration Events
// ============================================================================

/// Events emitted by the engine for UI collaborators
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    /// The socket is open
    Connected,

    /// The socket closed
    Disconnected {
        /// Close code, if the peer sent one
        code: Option<u16>,
        /// Human-readable reason
        reason: String,
    },

    /// Reconnection gave up; `connect()` must be called again
    ConnectionLost {
        /// Description of the terminal error
        error: String,
    },

    /// A batch of answer tokens was appended to an assistant message
    StreamChunkAppended {
        /// Conversation that received the text
        conversation_id: ConversationId,
        /// Assistant message being streamed into
        message_id: MessageId,
        /// Originating stream
        session_id: SessionId,
        /// Concatenated batch text
        text: String,
        /// Number of tokens in the batch
        token_count: usize,
    },

    /// A stream finished and all of its tokens were delivered
    StreamCompleted {
        /// Conversation the stream belonged to
        conversation_id: ConversationId,
        /// Finished stream
        session_id: SessionId,
        /// Final session metrics
        metrics: SessionMetrics,
    },

    /// The server reported an error for a stream
    StreamFailed {
        /// Conversation the stream belonged to
        conversation_id: ConversationId,
        /// Failed stream
        session_id: SessionId,
        /// Server error, or why the answer could not be stored
        error: String,
    },

    /// The server reported an error that is not tied to a stream
    ServerError {
        /// Error description from the server
        error: String,
    },

    /// Typing/status indicator changed
    Typing {
        /// Stream the indicator refers to, if any
        session_id: Option<SessionId>,
        /// Whether the model is producing output
        active: bool,
    },

    /// A placeholder conversation was confirmed under a canonical id
    ConversationConfirmed {
        /// Id the conversation was created with locally
        placeholder: ConversationId,
        /// Id assigned by the backend
        canonical: ConversationId,
    },

    /// A conversation title changed
    TitleUpdated {
        /// Conversation whose title changed
        conversation_id: ConversationId,
        /// New title
        title: String,
    },

    /// A conversation was removed
    ConversationDeleted {
        /// Removed conversation
        conversation_id: ConversationId,
        /// Active conversation after the removal
        active: Option<ConversationId>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_placeholder_ids() {
        let id = ConversationId::placeholder();
        assert!(id.is_placeholder());
        assert_ne!(id, ConversationId::placeholder());
        assert!(!ConversationId::from("c1").is_placeholder());
    }

    #[test]
    fn test_message_id_unique() {
        assert_ne!(MessageId::new(), MessageId::new());
    }

    #[test]
    fn test_stream_message_id_is_stable() {
        let session = SessionId::from("s1");
        assert_eq!(MessageId::for_stream(&session), MessageId::for_stream(&session));
    }

    #[test]
    fn test_duplicate_window() {
        let base = Utc::now();
        let a = Message::user("hi").at(base);
        let near = Message::user("hi").at(base + Duration::milliseconds(500));
        let far = Message::user("hi").at(base + Duration::milliseconds(3000));
        let other_role = Message::assistant("hi").at(base);

        assert!(a.is_duplicate_of(&near, 2000));
        assert!(!a.is_duplicate_of(&far, 2000));
        assert!(!a.is_duplicate_of(&other_role, 2000));
        assert!(a.is_duplicate_of(&a.clone().at(base + Duration::hours(1)), 2000));
    }

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&MessageRole::User).unwrap(), "\"user\"");
        let role: MessageRole = serde_json::from_str("\"assistant\"").unwrap();
        assert_eq!(role, MessageRole::Assistant);
    }
}
