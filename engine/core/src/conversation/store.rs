//! Conversation Store
//!
//! Owned map of conversations plus their creation order and the active
//! pointer. Identity rewrites and removals update all three in one call so
//! no caller ever observes a half-applied change.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  ConversationStore                    │
//! │  conversations: id ─► Conversation                    │
//! │  order:         [c1, c2, c3]   ← creation order       │
//! │  active:        c3                                    │
//! └──────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::messages::{ConversationId, Message, MessageId, MessageRole};

// ============================================================================
// Conversation
// ============================================================================

/// A conversation and its messages
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Current identity (placeholder until confirmed)
    pub id: ConversationId,
    /// Display title
    pub title: String,
    /// Messages sorted by creation time
    pub messages: Vec<Message>,
    /// Whether the backend knows this conversation
    pub is_backend_confirmed: bool,
    /// When the conversation was created locally
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Create an empty, unconfirmed conversation
    pub fn new(id: ConversationId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            messages: Vec::new(),
            is_backend_confirmed: false,
            created_at: Utc::now(),
        }
    }

    /// Whether `message` was already applied
    #[must_use]
    pub fn contains_duplicate(&self, message: &Message, window_ms: i64) -> bool {
        self.messages
            .iter()
            .any(|existing| existing.is_duplicate_of(message, window_ms))
    }

    /// Insert a message, keeping creation order
    ///
    /// Equal timestamps keep insertion order.
    pub fn insert_message(&mut self, message: Message) {
        let at = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(at, message);
    }

    /// Find a message by id
    pub fn message_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| &m.id == id)
    }

    /// Number of user messages
    #[must_use]
    pub fn user_message_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .count()
    }

    /// First user message, if any
    #[must_use]
    pub fn first_user_message(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.role == MessageRole::User)
    }
}

// ============================================================================
// Store
// ============================================================================

/// Why a rekey was refused
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RekeyError {
    /// No conversation under the old id
    #[error("conversation {0} not found")]
    NotFound(ConversationId),
    /// The new id is already taken
    #[error("conversation {0} already exists")]
    Occupied(ConversationId),
}

/// Conversations, creation order and active pointer
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: HashMap<ConversationId, Conversation>,
    order: Vec<ConversationId>,
    active: Option<ConversationId>,
}

impl ConversationStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a conversation
    ///
    /// Replaces any conversation stored under the same id. Becomes active
    /// when nothing else is.
    pub fn insert(&mut self, conversation: Conversation) {
        let id = conversation.id.clone();
        if self.conversations.insert(id.clone(), conversation).is_none() {
            self.order.push(id.clone());
        }
        if self.active.is_none() {
            self.active = Some(id);
        }
    }

    /// Look up a conversation
    #[must_use]
    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    /// Look up a conversation mutably
    pub fn get_mut(&mut self, id: &ConversationId) -> Option<&mut Conversation> {
        self.conversations.get_mut(id)
    }

    /// Whether `id` resolves
    #[must_use]
    pub fn contains(&self, id: &ConversationId) -> bool {
        self.conversations.contains_key(id)
    }

    /// Active conversation id
    #[must_use]
    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    /// Make `id` active; false if unknown
    pub fn set_active(&mut self, id: &ConversationId) -> bool {
        if self.contains(id) {
            self.active = Some(id.clone());
            true
        } else {
            false
        }
    }

    /// Conversations in creation order
    pub fn iter(&self) -> impl Iterator<Item = &Conversation> {
        self.order.iter().filter_map(|id| self.conversations.get(id))
    }

    /// Ids in creation order
    #[must_use]
    pub fn ids(&self) -> &[ConversationId] {
        &self.order
    }

    /// Number of conversations
    #[must_use]
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Move a conversation to a new id
    ///
    /// Map key, the record's own id, its slot in the creation order and the
    /// active pointer all change together.
    ///
    /// # Errors
    ///
    /// [`RekeyError::NotFound`] if `from` is unknown, [`RekeyError::Occupied`]
    /// if `to` is already in use.
    pub fn rekey(&mut self, from: &ConversationId, to: &ConversationId) -> Result<(), RekeyError> {
        if from == to {
            return Ok(());
        }
        if self.conversations.contains_key(to) {
            return Err(RekeyError::Occupied(to.clone()));
        }
        let mut conversation = self
            .conversations
            .remove(from)
            .ok_or_else(|| RekeyError::NotFound(from.clone()))?;

        conversation.id = to.clone();
        self.conversations.insert(to.clone(), conversation);
        for slot in &mut self.order {
            if slot == from {
                *slot = to.clone();
            }
        }
        if self.active.as_ref() == Some(from) {
            self.active = Some(to.clone());
        }
        Ok(())
    }

    /// Remove a conversation and repair the store
    ///
    /// Also drops entries whose record id no longer matches their key. If the
    /// active conversation is gone afterwards, the most recently created
    /// remaining conversation becomes active (or none).
    pub fn remove(&mut self, id: &ConversationId) -> Option<Conversation> {
        let removed = self.conversations.remove(id);
        let swept = self.sweep_inconsistent();
        if !swept.is_empty() {
            tracing::warn!(count = swept.len(), "Removed conversations with inconsistent identity");
        }

        let conversations = &self.conversations;
        self.order.retain(|slot| conversations.contains_key(slot));

        let active_valid = self
            .active
            .as_ref()
            .is_some_and(|active| self.conversations.contains_key(active));
        if !active_valid {
            self.active = self.order.last().cloned();
        }
        removed
    }

    fn sweep_inconsistent(&mut self) -> Vec<ConversationId> {
        let bad: Vec<ConversationId> = self
            .conversations
            .iter()
            .filter(|(key, conversation)| *key != &conversation.id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &bad {
            self.conversations.remove(key);
        }
        bad
    }
}
