//! Conversations
//!
//! - `store`: owned conversation map, creation order, active pointer
//! - `backend`: authoritative storage (REST or in-process)
//! - `title`: pushed-title subscriptions and the local fallback
//! - `reconciler`: optimistic create, dedupe, titles, deletion

pub mod backend;
pub mod reconciler;
pub mod store;
pub mod title;

pub use backend::{
    BackendCall, BackendError, ConversationBackend, CreatedConversation, HttpConversationBackend,
    InMemoryBackend,
};
pub use reconciler::{
    Appended, ConversationReconciler, ReconcileError, ReconcileNotice, ReconcilerConfig, TitleResult,
    TitleSource, DEFAULT_TITLE,
};
pub use store::{Conversation, ConversationStore, RekeyError};
pub use title::{heuristic_title, TitleHub, TitleSubscription};
