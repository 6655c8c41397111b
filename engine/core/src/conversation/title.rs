//! Title Subscriptions
//!
//! The server pushes a generated title for a conversation some time after
//! its first user message. `TitleHub` holds at most one open subscription per
//! conversation and delivers at most one title to it.
//!
//! ```text
//! reconciler ──subscribe(id)──► TitleHub ◄──publish(id, title)── engine
//!                                  │                          (title_updated)
//!                        oneshot   ▼
//!              TitleSubscription::wait(30s) ──► title | timeout
//! ```
//!
//! A subscription closes itself when dropped, whether it resolved, timed out,
//! or was abandoned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::messages::ConversationId;

/// Words kept by [`heuristic_title`]
const HEURISTIC_WORDS: usize = 6;

/// Longest title [`heuristic_title`] produces, in chars
const HEURISTIC_MAX_CHARS: usize = 50;

/// Identifies one subscription
pub type SubscriptionTicket = u64;

struct Waiter {
    ticket: SubscriptionTicket,
    sender: oneshot::Sender<String>,
}

/// Open title subscriptions keyed by conversation
#[derive(Clone, Default)]
pub struct TitleHub {
    waiters: Arc<DashMap<ConversationId, Waiter>>,
    next_ticket: Arc<AtomicU64>,
}

impl TitleHub {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a subscription for `id`, replacing any existing one
    #[must_use]
    pub fn subscribe(&self, id: &ConversationId) -> TitleSubscription {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = oneshot::channel();
        self.waiters.insert(id.clone(), Waiter { ticket, sender });
        tracing::debug!(conversation_id = %id, ticket, "Title subscription opened");
        TitleSubscription {
            hub: self.clone(),
            ticket,
            receiver: Some(receiver),
        }
    }

    /// Deliver a pushed title
    ///
    /// Returns false when no subscription is open for `id`.
    pub fn publish(&self, id: &ConversationId, title: &str) -> bool {
        match self.waiters.remove(id) {
            Some((_, waiter)) => waiter.sender.send(title.to_string()).is_ok(),
            None => false,
        }
    }

    /// Move an open subscription to a new conversation id
    pub fn rekey(&self, from: &ConversationId, to: &ConversationId) {
        if let Some((_, waiter)) = self.waiters.remove(from) {
            self.waiters.insert(to.clone(), waiter);
        }
    }

    /// Close the subscription for `id`, if any
    pub fn close(&self, id: &ConversationId) {
        self.waiters.remove(id);
    }

    /// Whether a subscription is open for `id`
    #[must_use]
    pub fn is_subscribed(&self, id: &ConversationId) -> bool {
        self.waiters.contains_key(id)
    }

    /// Number of open subscriptions
    #[must_use]
    pub fn open_subscriptions(&self) -> usize {
        self.waiters.len()
    }

    fn release(&self, ticket: SubscriptionTicket) {
        self.waiters.retain(|_, waiter| waiter.ticket != ticket);
    }
}

/// One pending title
pub struct TitleSubscription {
    hub: TitleHub,
    ticket: SubscriptionTicket,
    receiver: Option<oneshot::Receiver<String>>,
}

impl TitleSubscription {
    /// This subscription's ticket
    #[must_use]
    pub fn ticket(&self) -> SubscriptionTicket {
        self.ticket
    }

    /// Wait up to `limit` for the pushed title
    ///
    /// `None` on timeout or if the subscription was closed.
    pub async fn wait(mut self, limit: Duration) -> Option<String> {
        let receiver = self.receiver.take()?;
        match tokio::time::timeout(limit, receiver).await {
            Ok(Ok(title)) => Some(title),
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::debug!(ticket = self.ticket, "Title wait timed out");
                None
            }
        }
    }
}

impl Drop for TitleSubscription {
    fn drop(&mut self) {
        self.hub.release(self.ticket);
    }
}

/// Local fallback title from message text
///
/// First few words, capped in length, or `None` if there are no words.
#[must_use]
pub fn heuristic_title(content: &str) -> Option<String> {
    let words: Vec<&str> = content.split_whitespace().take(HEURISTIC_WORDS).collect();
    if words.is_empty() {
        return None;
    }
    let mut title = words.join(" ");
    let truncated = content.split_whitespace().count() > HEURISTIC_WORDS;

    if title.chars().count() > HEURISTIC_MAX_CHARS {
        title = title.chars().take(HEURISTIC_MAX_CHARS - 3).collect::<String>();
        title = title.trim_end().to_string();
        title.push_str("...");
    } else if truncated {
        title.push_str("...");
    }
    Some(title)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_resolves_subscription() {
        let hub = TitleHub::new();
        let id = ConversationId::from("c1");
        let subscription = hub.subscribe(&id);

        assert!(hub.publish(&id, "Rust questions"));
        assert_eq!(
            subscription.wait(Duration::from_secs(30)).await.as_deref(),
            Some("Rust questions")
        );
        assert_eq!(hub.open_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_publish_without_subscription() {
        let hub = TitleHub::new();
        assert!(!hub.publish(&ConversationId::from("c1"), "t"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_closes_subscription() {
        let hub = TitleHub::new();
        let id = ConversationId::from("c1");
        let subscription = hub.subscribe(&id);
        assert!(hub.is_subscribed(&id));

        assert_eq!(subscription.wait(Duration::from_secs(30)).await, None);
        assert!(!hub.is_subscribed(&id));
        assert!(!hub.publish(&id, "late"));
    }

    #[tokio::test]
    async fn test_rekey_keeps_subscription_and_drop_cleans_up() {
        let hub = TitleHub::new();
        let placeholder = ConversationId::from("p1");
        let canonical = ConversationId::from("c1");
        let subscription = hub.subscribe(&placeholder);

        hub.rekey(&placeholder, &canonical);
        assert!(hub.is_subscribed(&canonical));
        assert!(!hub.is_subscribed(&placeholder));

        drop(subscription);
        assert_eq!(hub.open_subscriptions(), 0);
    }

    #[test]
    fn test_heuristic_title() {
        assert_eq!(heuristic_title("  hello   world "), Some("hello world".to_string()));
        assert_eq!(
            heuristic_title("how do I write a tokio select loop properly"),
            Some("how do I write a tokio...".to_string())
        );
        assert_eq!(heuristic_title("   "), None);

        let long = "a".repeat(80);
        let title = heuristic_title(&long).unwrap();
        assert_eq!(title.chars().count(), 50);
        assert!(title.ends_with("..."));
    }
}
