//! Reasoning Session State Machine
//!
//! Interprets inbound stream events into per-session lifecycle and reasoning
//! content.
//!
//! # Lifecycle
//!
//! ```text
//!   (unseen) ──start / chunk / token──► Active ──complete / error──► Completed
//!                                         │ ▲
//!                                         └─┘ chunk / token
//! ```
//!
//! The machine owns no timers. It advances only when [`SessionMachine::handle`]
//! is called and answers with [`SessionEffect`]s; the caller routes answer
//! text to the batcher and flushes a stream before acting on its completion.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::ServerEvent;
use crate::messages::{ConversationId, SessionId};

/// Prefix inserted where old reasoning content was cut
pub const TRIM_MARKER: &str = "[... earlier reasoning trimmed ...]\n";

// ============================================================================
// Configuration
// ============================================================================

/// Reasoning content retention
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Content length (in chars) that triggers trimming
    pub max_content_chars: usize,
    /// Chars kept after trimming, not counting the marker
    pub retained_chars: usize,
    /// Finished sessions kept for late events and inspection; older ones
    /// are evicted first
    pub max_finished_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_content_chars: 10_000,
            retained_chars: 8_000,
            max_finished_sessions: 64,
        }
    }
}

// ============================================================================
// Session Types
// ============================================================================

/// Session counters
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    /// Seconds since the session started
    pub duration_seconds: f64,
    /// Approximate words received
    pub token_count: u64,
    /// Content events applied
    pub update_count: u64,
}

/// One reasoning session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReasoningSession {
    /// Session / stream id
    pub session_id: SessionId,
    /// Owning conversation
    pub conversation_id: ConversationId,
    /// Accumulated reasoning trace
    pub content: String,
    /// False once completed
    pub is_active: bool,
    /// When the session was created
    pub start_time: DateTime<Utc>,
    /// When the session completed
    pub end_time: Option<DateTime<Utc>>,
    /// Counters
    pub metrics: SessionMetrics,
    /// Model reported by token events
    pub model: Option<String>,
    /// Provider reported by token events
    pub provider: Option<String>,
    /// Ended by an error rather than a completion
    #[serde(default)]
    pub failed: bool,
}

impl ReasoningSession {
    fn new(session_id: SessionId, conversation_id: ConversationId, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            conversation_id,
            content: String::new(),
            is_active: true,
            start_time: now,
            end_time: None,
            metrics: SessionMetrics::default(),
            model: None,
            provider: None,
            failed: false,
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        #[allow(clippy::cast_precision_loss)]
        let seconds = (now - self.start_time).num_milliseconds().max(0) as f64 / 1000.0;
        self.metrics.duration_seconds = seconds;
    }

    fn record(&mut self, text: &str, now: DateTime<Utc>) {
        self.touch(now);
        self.metrics.token_count += text.split_whitespace().count() as u64;
        self.metrics.update_count += 1;
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.touch(now);
        self.is_active = false;
        self.end_time = Some(now);
    }
}

/// What the caller must do after an event
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEffect {
    /// A session was created
    Started {
        /// New session
        session_id: SessionId,
        /// Its conversation
        conversation_id: ConversationId,
    },
    /// Answer text for the visible conversation
    AnswerText {
        /// Originating stream
        session_id: SessionId,
        /// Target conversation
        conversation_id: ConversationId,
        /// The text
        text: String,
    },
    /// The session completed; flush the stream before reporting it
    Completed {
        /// Completed session
        session_id: SessionId,
        /// Its conversation
        conversation_id: ConversationId,
        /// Final counters
        metrics: SessionMetrics,
    },
    /// The server failed the session; flush the stream before reporting it
    Failed {
        /// Failed session
        session_id: SessionId,
        /// Its conversation
        conversation_id: ConversationId,
        /// Server message
        error: String,
    },
    /// A server error not tied to a known session
    ServerError {
        /// Server message
        error: String,
    },
    /// Typing indicator
    Typing {
        /// Stream, if named
        session_id: Option<SessionId>,
        /// Whether output is being produced
        active: bool,
    },
}

// ============================================================================
// State Machine
// ============================================================================

/// Sole owner of reasoning session state
#[derive(Debug, Default)]
pub struct SessionMachine {
    config: SessionConfig,
    sessions: HashMap<SessionId, ReasoningSession>,
    finished: VecDeque<SessionId>,
    conversation_hint: Option<ConversationId>,
}

impl SessionMachine {
    /// Create a machine with the given retention policy
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            finished: VecDeque::new(),
            conversation_hint: None,
        }
    }

    /// Conversation to assume for sessions whose events name none
    ///
    /// Without a hint the session id doubles as the conversation id.
    pub fn set_conversation_hint(&mut self, conversation_id: Option<ConversationId>) {
        self.conversation_hint = conversation_id;
    }

    /// Apply one inbound event
    pub fn handle(&mut self, event: &ServerEvent, now: DateTime<Utc>) -> Vec<SessionEffect> {
        let mut effects = Vec::new();

        match event {
            ServerEvent::SessionStarted {
                session_id,
                conversation_id,
            } => {
                if self.sessions.contains_key(session_id) {
                    tracing::debug!(session_id = %session_id, "Duplicate session start ignored");
                } else {
                    self.start(session_id, conversation_id.as_ref(), now, &mut effects);
                }
            }

            ServerEvent::StreamChunk {
                session_id,
                conversation_id,
                reasoning_content,
                content,
            } => {
                self.apply_content(
                    session_id,
                    conversation_id.as_ref(),
                    reasoning_content.as_deref(),
                    content.as_deref(),
                    now,
                    &mut effects,
                );
            }

            ServerEvent::Token {
                session_id,
                conversation_id,
                token,
                model,
                provider,
            } => {
                self.apply_content(
                    session_id,
                    conversation_id.as_ref(),
                    None,
                    Some(token),
                    now,
                    &mut effects,
                );
                if let Some(session) = self.sessions.get_mut(session_id) {
                    if model.is_some() {
                        session.model.clone_from(model);
                    }
                    if provider.is_some() {
                        session.provider.clone_from(provider);
                    }
                }
            }

            ServerEvent::StreamComplete { session_id, .. } => match self.sessions.get_mut(session_id) {
                Some(session) if session.is_active => {
                    session.finish(now);
                    tracing::info!(
                        session_id = %session_id,
                        tokens = session.metrics.token_count,
                        duration_secs = session.metrics.duration_seconds,
                        "Session completed"
                    );
                    effects.push(SessionEffect::Completed {
                        session_id: session_id.clone(),
                        conversation_id: session.conversation_id.clone(),
                        metrics: session.metrics.clone(),
                    });
                }
                Some(_) => tracing::debug!(session_id = %session_id, "Session already completed"),
                None => tracing::debug!(session_id = %session_id, "Completion for unknown session"),
            },

            ServerEvent::Error {
                session_id,
                message,
                ..
            } => {
                let session = session_id
                    .as_ref()
                    .and_then(|id| self.sessions.get_mut(id))
                    .filter(|s| s.is_active);
                match session {
                    Some(session) => {
                        session.finish(now);
                        session.failed = true;
                        tracing::warn!(session_id = %session.session_id, error = %message, "Session failed");
                        effects.push(SessionEffect::Failed {
                            session_id: session.session_id.clone(),
                            conversation_id: session.conversation_id.clone(),
                            error: message.clone(),
                        });
                    }
                    None => {
                        tracing::warn!(error = %message, "Server error");
                        effects.push(SessionEffect::ServerError {
                            error: message.clone(),
                        });
                    }
                }
            }

            ServerEvent::Typing {
                session_id,
                active,
                status,
            } => {
                let active = active.unwrap_or_else(|| {
                    !matches!(status.as_deref(), Some("idle" | "done" | "stopped"))
                });
                effects.push(SessionEffect::Typing {
                    session_id: session_id.clone(),
                    active,
                });
            }

            ServerEvent::ConnectionEstablished { .. }
            | ServerEvent::TitleUpdated { .. }
            | ServerEvent::Pong { .. } => {}

            ServerEvent::Unrecognized => {
                tracing::debug!("Ignoring unrecognized event");
            }
        }

        for effect in &effects {
            if let SessionEffect::Completed { session_id, .. } | SessionEffect::Failed { session_id, .. } =
                effect
            {
                self.retire(session_id);
            }
        }
        effects
    }

    /// Queue a finished session for eviction, dropping the oldest past the cap
    fn retire(&mut self, session_id: &SessionId) {
        self.finished.push_back(session_id.clone());
        while self.finished.len() > self.config.max_finished_sessions.max(1) {
            if let Some(oldest) = self.finished.pop_front() {
                self.sessions.remove(&oldest);
                tracing::trace!(session_id = %oldest, "Finished session evicted");
            }
        }
    }

    fn start(
        &mut self,
        session_id: &SessionId,
        conversation_id: Option<&ConversationId>,
        now: DateTime<Utc>,
        effects: &mut Vec<SessionEffect>,
    ) {
        let conversation_id = conversation_id
            .or(self.conversation_hint.as_ref())
            .cloned()
            .unwrap_or_else(|| ConversationId(session_id.0.clone()));

        tracing::info!(session_id = %session_id, conversation_id = %conversation_id, "Session started");
        self.sessions.insert(
            session_id.clone(),
            ReasoningSession::new(session_id.clone(), conversation_id.clone(), now),
        );
        effects.push(SessionEffect::Started {
            session_id: session_id.clone(),
            conversation_id,
        });
    }

    fn apply_content(
        &mut self,
        session_id: &SessionId,
        conversation_id: Option<&ConversationId>,
        reasoning: Option<&str>,
        answer: Option<&str>,
        now: DateTime<Utc>,
        effects: &mut Vec<SessionEffect>,
    ) {
        if !self.sessions.contains_key(session_id) {
            self.start(session_id, conversation_id, now, effects);
        }
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        if !session.is_active {
            tracing::debug!(session_id = %session_id, "Content after completion ignored");
            return;
        }

        if let Some(text) = reasoning.filter(|t| !t.is_empty()) {
            session.content.push_str(text);
            trim_content(&mut session.content, &self.config);
            session.record(text, now);
        }

        if let Some(text) = answer.filter(|t| !t.is_empty()) {
            session.record(text, now);
            effects.push(SessionEffect::AnswerText {
                session_id: session_id.clone(),
                conversation_id: session.conversation_id.clone(),
                text: text.to_string(),
            });
        }
    }

    /// Mark a session failed locally, ending it if still active
    ///
    /// Later content for the session is ignored. Returns false if the
    /// session is unknown or already failed.
    pub fn fail(&mut self, session_id: &SessionId, now: DateTime<Utc>) -> bool {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        if session.failed {
            return false;
        }
        session.failed = true;
        let was_active = session.is_active;
        if was_active {
            session.finish(now);
        }
        tracing::warn!(session_id = %session_id, "Session abandoned");
        if was_active {
            self.retire(session_id);
        }
        true
    }

    // ------------------------------------------------------------------------
    // Queries and cleanup
    // ------------------------------------------------------------------------

    /// Look up a session
    #[must_use]
    pub fn session(&self, session_id: &SessionId) -> Option<&ReasoningSession> {
        self.sessions.get(session_id)
    }

    /// Conversation a session belongs to
    #[must_use]
    pub fn conversation_of(&self, session_id: &SessionId) -> Option<&ConversationId> {
        self.sessions.get(session_id).map(|s| &s.conversation_id)
    }

    /// Sessions still streaming
    pub fn active_sessions(&self) -> impl Iterator<Item = &ReasoningSession> {
        self.sessions.values().filter(|s| s.is_active)
    }

    /// Number of tracked sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop one session
    pub fn remove_session(&mut self, session_id: &SessionId) -> Option<ReasoningSession> {
        self.finished.retain(|id| id != session_id);
        self.sessions.remove(session_id)
    }

    /// Drop every session of a conversation, returning their ids
    pub fn clear_conversation(&mut self, conversation_id: &ConversationId) -> Vec<SessionId> {
        let ids: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| &s.conversation_id == conversation_id)
            .map(|s| s.session_id.clone())
            .collect();
        for id in &ids {
            self.sessions.remove(id);
        }
        self.finished.retain(|id| !ids.contains(id));
        if self.conversation_hint.as_ref() == Some(conversation_id) {
            self.conversation_hint = None;
        }
        ids
    }

    /// Re-point sessions after a conversation changed identity
    pub fn rekey_conversation(&mut self, from: &ConversationId, to: &ConversationId) {
        for session in self.sessions.values_mut() {
            if &session.conversation_id == from {
                session.conversation_id = to.clone();
            }
        }
        if self.conversation_hint.as_ref() == Some(from) {
            self.conversation_hint = Some(to.clone());
        }
    }
}

/// Bound `content` to the configured retention window
///
/// Keeps the most recent `retained_chars` characters behind [`TRIM_MARKER`]
/// once the content grows past `max_content_chars`.
fn trim_content(content: &mut String, config: &SessionConfig) {
    let chars = content.chars().count();
    if chars <= config.max_content_chars {
        return;
    }
    let skip = chars.saturating_sub(config.retained_chars);
    let cut = content
        .char_indices()
        .nth(skip)
        .map_or(content.len(), |(index, _)| index);
    let tail = content.split_off(cut);
    *content = format!("{TRIM_MARKER}{tail}");
    tracing::debug!(dropped_chars = skip, "Reasoning content trimmed");
}
