//! Conversation Reconciler
//!
//! Sole writer of conversation and message state. Reconciles optimistic local
//! conversations with the backend's authoritative copy.
//!
//! # Optimistic create
//!
//! ```text
//! create_conversation() ──► local-<uuid>   (usable immediately, unconfirmed)
//!          │
//!   first user message
//!          ▼
//! backend.create_conversation(local-<uuid>)
//!          │ ok(conv-17)                        │ err
//!          ▼                                    ▼
//! rekey local-<uuid> → conv-17           stay unconfirmed, retried on the
//! (store, active pointer, title           next user message or reconnect
//!  subscription in one step)
//! ```
//!
//! Backend failures are logged and absorbed; local state stays
//! authoritative. Changes other components care about are queued as
//! [`ReconcileNotice`]s for the engine to drain.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::backend::{BackendError, ConversationBackend};
use super::store::{Conversation, ConversationStore, RekeyError};
use super::title::{heuristic_title, SubscriptionTicket, TitleHub};
use crate::messages::{ConversationId, Message, MessageId, MessageRole};

/// Title of a conversation nobody has named yet
pub const DEFAULT_TITLE: &str = "New Chat";

// ============================================================================
// Configuration
// ============================================================================

/// Reconciler configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// REST base URL; `None` keeps conversations in process
    pub api_base_url: Option<String>,
    /// Bearer token for the REST API
    pub api_token: Option<String>,
    /// Per-request timeout
    pub request_timeout_ms: u64,
    /// How long to wait for a pushed title before falling back
    pub title_wait_secs: u64,
    /// Window within which equal role+content counts as a redelivery
    pub dedupe_window_ms: i64,
    /// Title given to new conversations
    pub default_title: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            api_token: None,
            request_timeout_ms: 30_000,
            title_wait_secs: 30,
            dedupe_window_ms: 2000,
            default_title: DEFAULT_TITLE.to_string(),
        }
    }
}

impl ReconcilerConfig {
    /// Request timeout as a `Duration`
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Title wait as a `Duration`
    #[must_use]
    pub fn title_wait(&self) -> Duration {
        Duration::from_secs(self.title_wait_secs)
    }
}

// ============================================================================
// Errors, Notices, Title Results
// ============================================================================

/// Errors surfaced to callers of the reconciler
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// No conversation with this id exists locally or could be recovered
    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),

    /// A backend call the operation depends on failed
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Recovery of this conversation already failed on this connection
    #[error("conversation {0} could not be recovered")]
    Unrecoverable(ConversationId),
}

/// Outcome of [`ConversationReconciler::append_message`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Appended {
    /// Id the conversation has afterwards
    pub conversation_id: ConversationId,
    /// False when the message was a redelivery and nothing changed
    pub applied: bool,
}

/// State changes other components need to follow
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileNotice {
    /// A conversation moved from its placeholder to its canonical id
    Confirmed {
        /// Old id
        placeholder: ConversationId,
        /// New id
        canonical: ConversationId,
    },
    /// A title changed
    TitleUpdated {
        /// Conversation
        conversation_id: ConversationId,
        /// New title
        title: String,
    },
    /// A conversation was removed locally
    Deleted {
        /// Removed conversation
        conversation_id: ConversationId,
        /// Active conversation afterwards
        active: Option<ConversationId>,
    },
    /// A conversation was rebuilt from backend history
    Recovered {
        /// Recovered conversation
        conversation_id: ConversationId,
    },
}

/// Where a generated title came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TitleSource {
    /// Pushed by the server
    Server,
    /// Derived locally after the wait expired
    Heuristic,
}

/// Outcome of one title wait, fed back through
/// [`ConversationReconciler::apply_title_result`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TitleResult {
    /// Subscription that produced the result
    pub ticket: SubscriptionTicket,
    /// Title to apply, if any
    pub title: Option<String>,
    /// Origin of the title
    pub source: TitleSource,
}

// ============================================================================
// Reconciler
// ============================================================================

/// Owner of conversations and messages
pub struct ConversationReconciler<B: ConversationBackend> {
    backend: Arc<B>,
    config: ReconcilerConfig,
    store: ConversationStore,
    titles: TitleHub,
    title_results: mpsc::UnboundedSender<TitleResult>,
    pending_titles: HashMap<SubscriptionTicket, ConversationId>,
    unrecoverable: HashSet<ConversationId>,
    notices: Vec<ReconcileNotice>,
}

impl<B: ConversationBackend> ConversationReconciler<B> {
    /// Create a reconciler and the receiver for its title results
    pub fn new(
        backend: B,
        config: ReconcilerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TitleResult>) {
        let (title_results, title_rx) = mpsc::unbounded_channel();
        let reconciler = Self {
            backend: Arc::new(backend),
            config,
            store: ConversationStore::new(),
            titles: TitleHub::new(),
            title_results,
            pending_titles: HashMap::new(),
            unrecoverable: HashSet::new(),
            notices: Vec::new(),
        };
        (reconciler, title_rx)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Look up a conversation
    #[must_use]
    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.store.get(id)
    }

    /// Conversations in creation order
    pub fn conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.store.iter()
    }

    /// Active conversation
    #[must_use]
    pub fn active(&self) -> Option<&ConversationId> {
        self.store.active()
    }

    /// Switch the active conversation; false if unknown
    pub fn set_active(&mut self, id: &ConversationId) -> bool {
        self.store.set_active(id)
    }

    /// The backend in use
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Title subscriptions
    #[must_use]
    pub fn title_hub(&self) -> &TitleHub {
        &self.titles
    }

    /// Drain queued notices
    pub fn take_notices(&mut self) -> Vec<ReconcileNotice> {
        std::mem::take(&mut self.notices)
    }

    // ------------------------------------------------------------------------
    // Creation and confirmation
    // ------------------------------------------------------------------------

    /// Create a local conversation and make it active
    pub fn create_conversation(&mut self) -> ConversationId {
        let id = ConversationId::placeholder();
        self.store
            .insert(Conversation::new(id.clone(), self.config.default_title.clone()));
        self.store.set_active(&id);
        tracing::debug!(conversation_id = %id, "Conversation created locally");
        id
    }

    /// Append a message
    ///
    /// Redeliveries are silent no-ops reported with `applied: false`. A user
    /// message on an unconfirmed conversation triggers backend creation, and
    /// the first user message of an untitled conversation starts title
    /// generation.
    ///
    /// # Errors
    ///
    /// [`ReconcileError::UnknownConversation`] if `id` does not resolve.
    pub async fn append_message(
        &mut self,
        id: &ConversationId,
        message: Message,
    ) -> Result<Appended, ReconcileError> {
        let window = self.config.dedupe_window_ms;
        let conversation = self
            .store
            .get_mut(id)
            .ok_or_else(|| ReconcileError::UnknownConversation(id.clone()))?;

        if conversation.contains_duplicate(&message, window) {
            tracing::debug!(conversation_id = %id, message_id = %message.id, "Duplicate message ignored");
            return Ok(Appended {
                conversation_id: id.clone(),
                applied: false,
            });
        }

        let is_user = message.role == MessageRole::User;
        let content = message.content.clone();
        conversation.insert_message(message);

        let wants_title = is_user
            && conversation.user_message_count() == 1
            && conversation.title == self.config.default_title;
        let needs_confirm = is_user && !conversation.is_backend_confirmed;

        let mut current = id.clone();
        if needs_confirm {
            match self.confirm(id).await {
                Ok(canonical) => current = canonical,
                Err(e) => {
                    tracing::warn!(conversation_id = %id, error = %e, "Backend create failed, staying local");
                }
            }
        }

        if wants_title && !self.title_pending(&current) {
            self.start_title_generation(&current, &content);
        }
        Ok(Appended {
            conversation_id: current,
            applied: true,
        })
    }

    /// Retry backend creation of unconfirmed conversations that hold a user
    /// message; returns the ids confirmed
    pub async fn retry_unconfirmed(&mut self) -> Vec<ConversationId> {
        let pending: Vec<ConversationId> = self
            .store
            .iter()
            .filter(|c| !c.is_backend_confirmed && c.user_message_count() > 0)
            .map(|c| c.id.clone())
            .collect();

        let mut confirmed = Vec::new();
        for id in pending {
            match self.confirm(&id).await {
                Ok(canonical) => confirmed.push(canonical),
                Err(e) => tracing::warn!(conversation_id = %id, error = %e, "Retry of backend create failed"),
            }
        }
        confirmed
    }

    async fn confirm(&mut self, id: &ConversationId) -> Result<ConversationId, BackendError> {
        let title = self
            .store
            .get(id)
            .map(|c| c.title.clone())
            .unwrap_or_else(|| self.config.default_title.clone());
        let created = self.backend.create_conversation(id, &title).await?;
        let canonical = created.id;

        if &canonical != id {
            match self.store.rekey(id, &canonical) {
                Ok(()) => {}
                Err(RekeyError::Occupied(_)) => self.merge_into(id, &canonical),
                Err(RekeyError::NotFound(_)) => {
                    tracing::warn!(conversation_id = %id, "Conversation vanished during create");
                    return Ok(canonical);
                }
            }
            self.titles.rekey(id, &canonical);
            for target in self.pending_titles.values_mut() {
                if target == id {
                    *target = canonical.clone();
                }
            }
        }

        if let Some(conversation) = self.store.get_mut(&canonical) {
            conversation.is_backend_confirmed = true;
        }
        tracing::info!(placeholder = %id, canonical = %canonical, "Conversation confirmed");
        self.notices.push(ReconcileNotice::Confirmed {
            placeholder: id.clone(),
            canonical: canonical.clone(),
        });
        Ok(canonical)
    }

    /// Fold a placeholder into a conversation already stored under its
    /// canonical id
    fn merge_into(&mut self, from: &ConversationId, to: &ConversationId) {
        let was_active = self.store.active() == Some(from);
        let Some(source) = self.store.remove(from) else {
            return;
        };
        let window = self.config.dedupe_window_ms;
        if let Some(target) = self.store.get_mut(to) {
            for message in source.messages {
                if !target.contains_duplicate(&message, window) {
                    target.insert_message(message);
                }
            }
        }
        if was_active {
            self.store.set_active(to);
        }
        tracing::debug!(from = %from, to = %to, "Merged placeholder into existing conversation");
    }

    // ------------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------------

    /// Append streamed answer text to the assistant message `message_id`,
    /// creating it on first use
    ///
    /// An unknown conversation is recovered from backend history first. A
    /// failed recovery is remembered, and later text for that conversation
    /// is refused without another fetch until
    /// [`forget_failed_recoveries`](Self::forget_failed_recoveries).
    ///
    /// # Errors
    ///
    /// [`ReconcileError::Backend`] if recovery fails,
    /// [`ReconcileError::Unrecoverable`] if it failed before.
    pub async fn append_stream_text(
        &mut self,
        id: &ConversationId,
        message_id: &MessageId,
        text: &str,
    ) -> Result<ConversationId, ReconcileError> {
        if !self.store.contains(id) {
            if self.unrecoverable.contains(id) {
                return Err(ReconcileError::Unrecoverable(id.clone()));
            }
            if let Err(e) = self.recover(id).await {
                self.unrecoverable.insert(id.clone());
                return Err(e);
            }
        }
        let conversation = self
            .store
            .get_mut(id)
            .ok_or_else(|| ReconcileError::UnknownConversation(id.clone()))?;

        match conversation.message_mut(message_id) {
            Some(message) => message.content.push_str(text),
            None => conversation.insert_message(Message::assistant(text).with_id(message_id.clone())),
        }
        Ok(id.clone())
    }

    /// Rebuild a conversation from backend history
    ///
    /// # Errors
    ///
    /// [`ReconcileError::Backend`] if the history cannot be fetched.
    pub async fn recover(&mut self, id: &ConversationId) -> Result<(), ReconcileError> {
        let history = self.backend.fetch_history(id).await?;
        let window = self.config.dedupe_window_ms;

        let mut conversation = self
            .store
            .get(id)
            .cloned()
            .unwrap_or_else(|| Conversation::new(id.clone(), self.config.default_title.clone()));
        conversation.is_backend_confirmed = true;
        let fetched = history.len();
        for message in history {
            if !conversation.contains_duplicate(&message, window) {
                conversation.insert_message(message);
            }
        }
        self.store.insert(conversation);
        self.unrecoverable.remove(id);

        tracing::info!(conversation_id = %id, messages = fetched, "Conversation recovered");
        self.notices.push(ReconcileNotice::Recovered {
            conversation_id: id.clone(),
        });
        Ok(())
    }

    /// Allow recovery of conversations whose recovery failed earlier
    pub fn forget_failed_recoveries(&mut self) {
        if !self.unrecoverable.is_empty() {
            tracing::debug!(count = self.unrecoverable.len(), "Clearing failed recoveries");
            self.unrecoverable.clear();
        }
    }

    // ------------------------------------------------------------------------
    // Titles
    // ------------------------------------------------------------------------

    /// Rename a conversation
    ///
    /// Closes any pending title subscription. The backend copy is updated on
    /// a best-effort basis.
    ///
    /// # Errors
    ///
    /// [`ReconcileError::UnknownConversation`] if `id` does not resolve.
    pub async fn update_title(
        &mut self,
        id: &ConversationId,
        title: &str,
    ) -> Result<(), ReconcileError> {
        if !self.store.contains(id) {
            return Err(ReconcileError::UnknownConversation(id.clone()));
        }
        self.titles.close(id);
        self.apply_title(id, title.to_string(), true).await;
        Ok(())
    }

    /// Route a pushed title
    ///
    /// Resolves an open subscription if there is one, otherwise applies the
    /// title directly (recovering the conversation if needed).
    pub async fn handle_title_push(&mut self, id: &ConversationId, title: &str) {
        if self.titles.publish(id, title) {
            return;
        }
        if !self.store.contains(id) {
            if let Err(e) = self.recover(id).await {
                tracing::warn!(conversation_id = %id, error = %e, "Title for unknown conversation dropped");
                return;
            }
        }
        self.apply_title(id, title.to_string(), false).await;
    }

    /// Apply the outcome of a title wait
    pub async fn apply_title_result(&mut self, result: TitleResult) {
        let Some(id) = self.pending_titles.remove(&result.ticket) else {
            tracing::debug!(ticket = result.ticket, "Stale title result ignored");
            return;
        };
        let Some(title) = result.title else {
            return;
        };
        match result.source {
            TitleSource::Server => self.apply_title(&id, title, false).await,
            TitleSource::Heuristic => {
                let untitled = self
                    .store
                    .get(&id)
                    .is_some_and(|c| c.title == self.config.default_title);
                if untitled {
                    self.apply_title(&id, title, true).await;
                }
            }
        }
    }

    fn title_pending(&self, id: &ConversationId) -> bool {
        self.pending_titles.values().any(|pending| pending == id)
    }

    fn start_title_generation(&mut self, id: &ConversationId, content: &str) {
        let subscription = self.titles.subscribe(id);
        let ticket = subscription.ticket();
        self.pending_titles.insert(ticket, id.clone());

        let fallback = heuristic_title(content);
        let wait = self.config.title_wait();
        let results = self.title_results.clone();
        tokio::spawn(async move {
            let result = match subscription.wait(wait).await {
                Some(title) => TitleResult {
                    ticket,
                    title: Some(title),
                    source: TitleSource::Server,
                },
                None => TitleResult {
                    ticket,
                    title: fallback,
                    source: TitleSource::Heuristic,
                },
            };
            let _ = results.send(result);
        });
    }

    async fn apply_title(&mut self, id: &ConversationId, title: String, sync_backend: bool) {
        let Some(conversation) = self.store.get_mut(id) else {
            return;
        };
        if conversation.title == title {
            return;
        }
        conversation.title.clone_from(&title);
        let confirmed = conversation.is_backend_confirmed;
        tracing::info!(conversation_id = %id, title = %title, "Title updated");

        if sync_backend && confirmed {
            if let Err(e) = self.backend.update_title(id, &title).await {
                tracing::warn!(conversation_id = %id, error = %e, "Backend title update failed");
            }
        }
        self.notices.push(ReconcileNotice::TitleUpdated {
            conversation_id: id.clone(),
            title,
        });
    }

    // ------------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------------

    /// Delete a conversation
    ///
    /// Idempotent: a backend "not found" counts as deleted and local cleanup
    /// always runs. Returns the active conversation afterwards.
    pub async fn delete_conversation(&mut self, id: &ConversationId) -> Option<ConversationId> {
        let known_to_backend = self
            .store
            .get(id)
            .map_or(!id.is_placeholder(), |c| c.is_backend_confirmed);

        if known_to_backend {
            match self.backend.delete_conversation(id).await {
                Ok(()) => tracing::debug!(conversation_id = %id, "Backend delete succeeded"),
                Err(BackendError::NotFound) => {
                    tracing::debug!(conversation_id = %id, "Backend had no such conversation");
                }
                Err(e) => tracing::warn!(conversation_id = %id, error = %e, "Backend delete failed"),
            }
        }

        self.store.remove(id);
        self.titles.close(id);
        self.pending_titles.retain(|_, pending| pending != id);

        let active = self.store.active().cloned();
        tracing::info!(conversation_id = %id, active = ?active, "Conversation deleted");
        self.notices.push(ReconcileNotice::Deleted {
            conversation_id: id.clone(),
            active: active.clone(),
        });
        active
    }
}
