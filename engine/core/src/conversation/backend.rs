//! Conversation Backend
//!
//! The authoritative store the reconciler confirms against. Two
//! implementations:
//! - `HttpConversationBackend`: REST API over reqwest
//! - `InMemoryBackend`: process-local, for offline use and tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::messages::{ConversationId, Message};

// ============================================================================
// Trait
// ============================================================================

/// Errors returned by a backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The conversation does not exist on the backend
    #[error("conversation not found")]
    NotFound,

    /// The request could not be completed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with an error status
    #[error("backend returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// The response body did not match the expected shape
    #[error("failed to decode response: {0}")]
    Decode(String),
}

/// Backend acknowledgement of a created conversation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedConversation {
    /// Canonical id
    pub id: ConversationId,
    /// Title stored by the backend
    #[serde(default)]
    pub title: Option<String>,
}

/// Authoritative conversation storage
#[async_trait]
pub trait ConversationBackend: Send + Sync + 'static {
    /// Create a conversation
    ///
    /// `client_id` is the local placeholder; backends may use it to make the
    /// call idempotent.
    async fn create_conversation(
        &self,
        client_id: &ConversationId,
        title: &str,
    ) -> Result<CreatedConversation, BackendError>;

    /// Rename a conversation
    async fn update_title(&self, id: &ConversationId, title: &str) -> Result<(), BackendError>;

    /// Delete a conversation; [`BackendError::NotFound`] if it is already gone
    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), BackendError>;

    /// Full message history of a conversation
    async fn fetch_history(&self, id: &ConversationId) -> Result<Vec<Message>, BackendError>;
}

// ============================================================================
// HTTP
// ============================================================================

/// REST backend
///
/// | Operation | Request |
/// |-----------|---------|
/// | create    | `POST {base}/conversations` |
/// | title     | `PATCH {base}/conversations/{id}` |
/// | delete    | `DELETE {base}/conversations/{id}` |
/// | history   | `GET {base}/conversations/{id}/messages` |
#[derive(Clone, Debug)]
pub struct HttpConversationBackend {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    client_id: &'a ConversationId,
    title: &'a str,
}

#[derive(Serialize)]
struct TitleRequest<'a> {
    title: &'a str,
}

impl HttpConversationBackend {
    /// Create a client for `base_url`
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Http`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
        })
    }

    /// Base URL without trailing slash
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, BackendError> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ConversationBackend for HttpConversationBackend {
    async fn create_conversation(
        &self,
        client_id: &ConversationId,
        title: &str,
    ) -> Result<CreatedConversation, BackendError> {
        let request = self
            .client
            .post(self.url("/conversations"))
            .json(&CreateRequest { client_id, title });
        let response = self.execute(request).await?;
        response
            .json::<CreatedConversation>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn update_title(&self, id: &ConversationId, title: &str) -> Result<(), BackendError> {
        let request = self
            .client
            .patch(self.url(&format!("/conversations/{id}")))
            .json(&TitleRequest { title });
        self.execute(request).await?;
        Ok(())
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), BackendError> {
        let request = self.client.delete(self.url(&format!("/conversations/{id}")));
        self.execute(request).await?;
        Ok(())
    }

    async fn fetch_history(&self, id: &ConversationId) -> Result<Vec<Message>, BackendError> {
        let request = self
            .client
            .get(self.url(&format!("/conversations/{id}/messages")));
        let response = self.execute(request).await?;
        response
            .json::<Vec<Message>>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}

// ============================================================================
// In-Memory
// ============================================================================

/// A call recorded by [`InMemoryBackend`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCall {
    /// `create_conversation`
    Create(ConversationId),
    /// `update_title`
    UpdateTitle(ConversationId, String),
    /// `delete_conversation`
    Delete(ConversationId),
    /// `fetch_history`
    FetchHistory(ConversationId),
}

#[derive(Debug, Default)]
struct StoredConversation {
    title: String,
    messages: Vec<Message>,
}

#[derive(Debug, Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, StoredConversation>,
    by_client_id: HashMap<ConversationId, ConversationId>,
    next_id: u64,
    failing_creates: usize,
    calls: Vec<BackendCall>,
}

/// Process-local backend
///
/// Assigns canonical ids `conv-1`, `conv-2`, ... and treats repeated creates
/// with the same client id as the same conversation. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryBackend {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` creates fail with a 503
    pub fn fail_next_creates(&self, count: usize) {
        self.state.lock().failing_creates = count;
    }

    /// Store a conversation directly
    pub fn seed(&self, id: ConversationId, title: impl Into<String>, messages: Vec<Message>) {
        self.state.lock().conversations.insert(
            id,
            StoredConversation {
                title: title.into(),
                messages,
            },
        );
    }

    /// Whether the backend holds `id`
    #[must_use]
    pub fn contains(&self, id: &ConversationId) -> bool {
        self.state.lock().conversations.contains_key(id)
    }

    /// Stored title of `id`
    #[must_use]
    pub fn title_of(&self, id: &ConversationId) -> Option<String> {
        self.state.lock().conversations.get(id).map(|c| c.title.clone())
    }

    /// Every call made so far
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }
}

#[async_trait]
impl ConversationBackend for InMemoryBackend {
    async fn create_conversation(
        &self,
        client_id: &ConversationId,
        title: &str,
    ) -> Result<CreatedConversation, BackendError> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::Create(client_id.clone()));

        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(BackendError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }

        if let Some(existing) = state.by_client_id.get(client_id).cloned() {
            let title = state.conversations.get(&existing).map(|c| c.title.clone());
            return Ok(CreatedConversation { id: existing, title });
        }

        state.next_id += 1;
        let id = ConversationId(format!("conv-{}", state.next_id));
        state.by_client_id.insert(client_id.clone(), id.clone());
        state.conversations.insert(
            id.clone(),
            StoredConversation {
                title: title.to_string(),
                messages: Vec::new(),
            },
        );
        Ok(CreatedConversation {
            id,
            title: Some(title.to_string()),
        })
    }

    async fn update_title(&self, id: &ConversationId, title: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state
            .calls
            .push(BackendCall::UpdateTitle(id.clone(), title.to_string()));
        let conversation = state
            .conversations
            .get_mut(id)
            .ok_or(BackendError::NotFound)?;
        conversation.title = title.to_string();
        Ok(())
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::Delete(id.clone()));
        state
            .conversations
            .remove(id)
            .map(|_| ())
            .ok_or(BackendError::NotFound)
    }

    async fn fetch_history(&self, id: &ConversationId) -> Result<Vec<Message>, BackendError> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::FetchHistory(id.clone()));
        state
            .conversations
            .get(id)
            .map(|c| c.messages.clone())
            .ok_or(BackendError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_create_is_idempotent_per_client_id() {
        let backend = InMemoryBackend::new();
        let placeholder = ConversationId::placeholder();
        let first = backend.create_conversation(&placeholder, "t").await.unwrap();
        let second = backend.create_conversation(&placeholder, "t").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.id, ConversationId::from("conv-1"));
    }

    #[tokio::test]
    async fn test_memory_injected_failures() {
        let backend = InMemoryBackend::new();
        backend.fail_next_creates(1);
        let id = ConversationId::placeholder();
        assert!(matches!(
            backend.create_conversation(&id, "t").await,
            Err(BackendError::Status { status: 503, .. })
        ));
        assert!(backend.create_conversation(&id, "t").await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_delete_reports_not_found() {
        let backend = InMemoryBackend::new();
        let id = ConversationId::from("c1");
        backend.seed(id.clone(), "t", Vec::new());
        assert!(backend.delete_conversation(&id).await.is_ok());
        assert!(matches!(
            backend.delete_conversation(&id).await,
            Err(BackendError::NotFound)
        ));
    }

    #[test]
    fn test_http_base_url_is_normalized() {
        let backend =
            HttpConversationBackend::new("http://api.local/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(backend.base_url(), "http://api.local");
        assert_eq!(backend.url("/conversations"), "http://api.local/conversations");
    }

    #[tokio::test]
    async fn test_http_unreachable_is_http_error() {
        let backend =
            HttpConversationBackend::new("http://127.0.0.1:1", None, Duration::from_secs(1)).unwrap();
        let result = backend.fetch_history(&ConversationId::from("c1")).await;
        assert!(matches!(result, Err(BackendError::Http(_))));
    }
}
