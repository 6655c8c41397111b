//! Engine
//!
//! Wires the four components into one event loop.
//!
//! ```text
//!  socket ──► ConnectionManager ──ConnectionEvent──┐
//!                                                  ▼
//!                                   ┌──────────── Engine ─────────────┐
//!                                   │ SessionMachine ──AnswerText──┐  │
//!   frame ticker ──FrameTick───────►│ TokenBatcher ◄───────────────┘  │
//!                                   │      │ batches                  │
//!   title waits ──TitleResult──────►│ ConversationReconciler ◄────────┘
//!                                   └────────────────┬────────────────┘
//!                                                    ▼
//!                                              EngineEvent (UI)
//! ```
//!
//! The engine is the single writer of every component's state. Inputs are
//! taken one at a time from [`Engine::next_input`] and applied with
//! [`Engine::dispatch`]; nothing else mutates the components concurrently.

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::EngineConfig;
use crate::conversation::{
    Conversation, ConversationBackend, ConversationReconciler, ReconcileError, ReconcileNotice,
    TitleResult,
};
use crate::events::{ClientFrame, ServerEvent};
use crate::messages::{ConversationId, EngineEvent, Message, MessageId, SessionId};
use crate::session::{SessionEffect, SessionMachine};
use crate::streaming::{BatchingConfig, PerformanceStats, TokenBatch, TokenBatcher};
use crate::transport::{
    ConnectError, ConnectionEvent, ConnectionManager, ConnectionStatus, SocketConnector,
    TransportError,
};

/// Errors returned by user-triggered engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Opening the connection failed
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// A frame could not be sent
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The reconciler rejected the operation
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// The message repeats one sent moments ago and was not sent again
    #[error("duplicate message in conversation {0}")]
    DuplicateMessage(ConversationId),
}

/// One unit of work for [`Engine::dispatch`]
#[derive(Clone, Debug, PartialEq)]
pub enum EngineInput {
    /// Something happened on the connection
    Connection(ConnectionEvent),
    /// A title wait finished
    Title(TitleResult),
    /// The frame pacer fired
    FrameTick(Instant),
}

/// Streaming and conversation sync engine
pub struct Engine<C: SocketConnector, B: ConversationBackend> {
    connection: ConnectionManager<C>,
    connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    batcher: TokenBatcher,
    sessions: SessionMachine,
    reconciler: ConversationReconciler<B>,
    title_results: mpsc::UnboundedReceiver<TitleResult>,
    frame_ticker: Option<Interval>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl<C: SocketConnector, B: ConversationBackend> Engine<C, B> {
    /// Create an engine and the receiver for its integration events
    pub fn new(
        connector: C,
        backend: B,
        config: EngineConfig,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (connection, connection_events) = ConnectionManager::new(connector, config.connection);
        let (reconciler, title_results) = ConversationReconciler::new(backend, config.reconciler);
        let (events, events_rx) = mpsc::unbounded_channel();

        let engine = Self {
            connection,
            connection_events,
            batcher: TokenBatcher::new(config.batching),
            sessions: SessionMachine::new(config.session),
            reconciler,
            title_results,
            frame_ticker: None,
            events,
        };
        (engine, events_rx)
    }

    // ========================================================================
    // Connection
    // ========================================================================

    /// Open the connection; a no-op while connecting or connected
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Connect`] if the socket does not open.
    pub async fn connect(&mut self) -> Result<(), EngineError> {
        self.connection.connect().await?;
        Ok(())
    }

    /// Close the connection without reconnecting
    pub async fn disconnect(&mut self) {
        self.connection.disconnect().await;
    }

    /// Current connection state
    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    // ========================================================================
    // Event Loop
    // ========================================================================

    /// Wait for the next input
    ///
    /// Cancel-safe, so it can sit in a caller's `select!` next to other
    /// sources. Frame ticks are only produced while the batcher holds tokens.
    pub async fn next_input(&mut self) -> Option<EngineInput> {
        let pacing = self.batcher.has_pending();
        let period = self.batcher.config().frame_interval();
        let ticker = self.frame_ticker.get_or_insert_with(|| frame_ticker(period));

        tokio::select! {
            Some(event) = self.connection_events.recv() => Some(EngineInput::Connection(event)),
            Some(result) = self.title_results.recv() => Some(EngineInput::Title(result)),
            now = ticker.tick(), if pacing => Some(EngineInput::FrameTick(now)),
            else => None,
        }
    }

    /// Apply one input
    pub async fn dispatch(&mut self, input: EngineInput) {
        match input {
            EngineInput::Connection(event) => self.handle_connection_event(event).await,
            EngineInput::Title(result) => self.reconciler.apply_title_result(result).await,
            EngineInput::FrameTick(now) => {
                let mut batches = Vec::new();
                self.batcher.tick(now, &mut |b: TokenBatch| batches.push(b));
                self.deliver_batches(batches).await;
            }
        }
        self.forward_notices();
    }

    /// Wait for and apply one input; false once every input source is closed
    pub async fn step(&mut self) -> bool {
        match self.next_input().await {
            Some(input) => {
                self.dispatch(input).await;
                true
            }
            None => false,
        }
    }

    /// Apply inputs until every input source is closed
    pub async fn run(&mut self) {
        while self.step().await {}
        tracing::debug!("Engine input sources closed");
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                self.emit(EngineEvent::Connected);
                self.reconciler.forget_failed_recoveries();
                let confirmed = self.reconciler.retry_unconfirmed().await;
                if !confirmed.is_empty() {
                    tracing::info!(count = confirmed.len(), "Confirmed conversations after reconnect");
                }
            }
            ConnectionEvent::Disconnected { code, reason } => {
                self.emit(EngineEvent::Disconnected { code, reason });
            }
            ConnectionEvent::Error(error) => {
                tracing::error!(error = %error, "Connection lost");
                self.emit(EngineEvent::ConnectionLost {
                    error: error.to_string(),
                });
            }
            ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
            }
            ConnectionEvent::Message(ServerEvent::TitleUpdated {
                conversation_id,
                title,
            }) => {
                self.reconciler
                    .handle_title_push(&conversation_id, &title)
                    .await;
            }
            ConnectionEvent::Message(event) => {
                let effects = self.sessions.handle(&event, Utc::now());
                for effect in effects {
                    self.apply_effect(effect).await;
                }
            }
        }
    }

    async fn apply_effect(&mut self, effect: SessionEffect) {
        match effect {
            SessionEffect::Started {
                session_id,
                conversation_id,
            } => {
                tracing::debug!(session_id = %session_id, conversation_id = %conversation_id, "Stream opened");
            }
            SessionEffect::AnswerText {
                session_id, text, ..
            } => {
                let mut batches = Vec::new();
                self.batcher
                    .process(&session_id, text, Instant::now(), &mut |b: TokenBatch| {
                        batches.push(b);
                    });
                self.deliver_batches(batches).await;
            }
            SessionEffect::Completed {
                session_id,
                conversation_id,
                metrics,
            } => {
                self.flush_stream(&session_id).await;
                if self.sessions.session(&session_id).is_some_and(|s| s.failed) {
                    return;
                }
                let conversation_id = self.current_conversation(&session_id, conversation_id);
                self.emit(EngineEvent::StreamCompleted {
                    conversation_id,
                    session_id,
                    metrics,
                });
            }
            SessionEffect::Failed {
                session_id,
                conversation_id,
                error,
            } => {
                self.flush_stream(&session_id).await;
                let conversation_id = self.current_conversation(&session_id, conversation_id);
                self.emit(EngineEvent::StreamFailed {
                    conversation_id,
                    session_id,
                    error,
                });
            }
            SessionEffect::ServerError { error } => self.emit(EngineEvent::ServerError { error }),
            SessionEffect::Typing { session_id, active } => {
                self.emit(EngineEvent::Typing { session_id, active });
            }
        }
    }

    async fn flush_stream(&mut self, session_id: &SessionId) {
        let mut batches = Vec::new();
        self.batcher
            .flush(session_id, Instant::now(), &mut |b: TokenBatch| batches.push(b));
        self.deliver_batches(batches).await;
    }

    /// Session's conversation after any rekey, else the one it started with
    fn current_conversation(
        &self,
        session_id: &SessionId,
        fallback: ConversationId,
    ) -> ConversationId {
        self.sessions
            .conversation_of(session_id)
            .cloned()
            .unwrap_or(fallback)
    }

    async fn deliver_batches(&mut self, batches: Vec<TokenBatch>) {
        for batch in batches {
            let session_id = batch.stream_id().clone();
            let Some(conversation_id) = self.sessions.conversation_of(&session_id).cloned() else {
                tracing::debug!(session_id = %session_id, "Batch for dropped session discarded");
                continue;
            };
            let message_id = MessageId::for_stream(&session_id);
            let token_count = batch.len();
            let text = batch.text();

            match self
                .reconciler
                .append_stream_text(&conversation_id, &message_id, &text)
                .await
            {
                Ok(conversation_id) => {
                    tracing::trace!(session_id = %session_id, tokens = token_count, "Batch appended");
                    self.emit(EngineEvent::StreamChunkAppended {
                        conversation_id,
                        message_id,
                        session_id,
                        text,
                        token_count,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        conversation_id = %conversation_id,
                        error = %e,
                        "Dropping batch for unrecoverable conversation"
                    );
                    self.abandon_stream(&session_id, conversation_id, &e);
                }
            }
        }
    }

    /// Stop a stream whose answer has nowhere to go
    ///
    /// The session is marked failed so later tokens are ignored and its
    /// completion is not reported. Queued tokens are discarded.
    fn abandon_stream(
        &mut self,
        session_id: &SessionId,
        conversation_id: ConversationId,
        error: &ReconcileError,
    ) {
        if !self.sessions.fail(session_id, Utc::now()) {
            return;
        }
        self.batcher
            .flush(session_id, Instant::now(), &mut |_: TokenBatch| {});
        self.emit(EngineEvent::StreamFailed {
            conversation_id,
            session_id: session_id.clone(),
            error: error.to_string(),
        });
    }

    fn forward_notices(&mut self) {
        for notice in self.reconciler.take_notices() {
            match notice {
                ReconcileNotice::Confirmed {
                    placeholder,
                    canonical,
                } => {
                    self.sessions.rekey_conversation(&placeholder, &canonical);
                    self.emit(EngineEvent::ConversationConfirmed {
                        placeholder,
                        canonical,
                    });
                }
                ReconcileNotice::TitleUpdated {
                    conversation_id,
                    title,
                } => self.emit(EngineEvent::TitleUpdated {
                    conversation_id,
                    title,
                }),
                ReconcileNotice::Deleted {
                    conversation_id,
                    active,
                } => {
                    for session_id in self.sessions.clear_conversation(&conversation_id) {
                        self.batcher
                            .flush(&session_id, Instant::now(), &mut |_: TokenBatch| {});
                    }
                    self.emit(EngineEvent::ConversationDeleted {
                        conversation_id,
                        active,
                    });
                }
                ReconcileNotice::Recovered { conversation_id } => {
                    tracing::debug!(conversation_id = %conversation_id, "Recovered conversation in view");
                }
            }
        }
    }

    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("No listener for engine events");
        }
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    /// Start a local conversation and make it active
    pub fn create_conversation(&mut self) -> ConversationId {
        self.reconciler.create_conversation()
    }

    /// Record a user message and send it to the server
    ///
    /// The message is stored (and the conversation confirmed if needed)
    /// before the frame goes out, so it survives a send failure.
    ///
    /// # Errors
    ///
    /// [`EngineError::Reconcile`] if the conversation is unknown,
    /// [`EngineError::DuplicateMessage`] if the same text was just sent,
    /// [`EngineError::Transport`] if the frame cannot be sent.
    pub async fn send_user_message(
        &mut self,
        conversation_id: &ConversationId,
        content: impl Into<String>,
    ) -> Result<MessageId, EngineError> {
        let message = Message::user(content);
        let message_id = message.id.clone();
        let content = message.content.clone();

        let result = self.reconciler.append_message(conversation_id, message).await;
        self.forward_notices();
        let appended = result?;
        let conversation_id = appended.conversation_id;
        if !appended.applied {
            return Err(EngineError::DuplicateMessage(conversation_id));
        }

        self.sessions
            .set_conversation_hint(Some(conversation_id.clone()));
        self.connection.send(&ClientFrame::Message {
            conversation_id,
            message_id: message_id.clone(),
            content,
        })?;
        Ok(message_id)
    }

    /// Rename a conversation
    ///
    /// # Errors
    ///
    /// [`EngineError::Reconcile`] if the conversation is unknown.
    pub async fn update_title(
        &mut self,
        conversation_id: &ConversationId,
        title: &str,
    ) -> Result<(), EngineError> {
        let result = self.reconciler.update_title(conversation_id, title).await;
        self.forward_notices();
        Ok(result?)
    }

    /// Delete a conversation; returns the active conversation afterwards
    pub async fn delete_conversation(
        &mut self,
        conversation_id: &ConversationId,
    ) -> Option<ConversationId> {
        let active = self.reconciler.delete_conversation(conversation_id).await;
        self.forward_notices();
        active
    }

    /// Make `conversation_id` the active conversation
    pub fn set_active(&mut self, conversation_id: &ConversationId) -> bool {
        self.reconciler.set_active(conversation_id)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Look up a conversation
    #[must_use]
    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<&Conversation> {
        self.reconciler.conversation(conversation_id)
    }

    /// Conversations in creation order
    pub fn conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.reconciler.conversations()
    }

    /// Active conversation
    #[must_use]
    pub fn active_conversation(&self) -> Option<&ConversationId> {
        self.reconciler.active()
    }

    /// Reasoning sessions
    #[must_use]
    pub fn sessions(&self) -> &SessionMachine {
        &self.sessions
    }

    /// Batching policy in use
    #[must_use]
    pub fn batching(&self) -> &BatchingConfig {
        self.batcher.config()
    }

    /// Batcher counters
    #[must_use]
    pub fn stream_stats(&self) -> &PerformanceStats {
        self.batcher.stats()
    }

    /// The conversation backend
    #[must_use]
    pub fn backend(&self) -> &B {
        self.reconciler.backend()
    }
}

fn frame_ticker(period: std::time::Duration) -> Interval {
    let mut ticker = tokio::time::interval(period.max(std::time::Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{BackendCall, InMemoryBackend};
    use crate::transport::{ConnectPlan, MemoryConnector, MemoryPeer, MemoryServer, PeerFrame};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    type TestEngine = Engine<MemoryConnector, InMemoryBackend>;

    fn engine(config: EngineConfig) -> (TestEngine, mpsc::UnboundedReceiver<EngineEvent>, MemoryServer) {
        let (connector, server) = MemoryConnector::new();
        let (engine, events) = Engine::new(connector, InMemoryBackend::new(), config);
        (engine, events, server)
    }

    async fn connected(config: EngineConfig) -> (TestEngine, mpsc::UnboundedReceiver<EngineEvent>, MemoryPeer) {
        let (mut engine, mut events, mut server) = engine(config);
        engine.connect().await.unwrap();
        let peer = server.accept().await.unwrap();
        assert!(engine.step().await);
        assert_eq!(events.recv().await, Some(EngineEvent::Connected));
        (engine, events, peer)
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_engine_create_is_local() {
        let (mut engine, _events, _server) = engine(EngineConfig::default());
        let id = engine.create_conversation();
        assert!(id.is_placeholder());
        assert_eq!(engine.active_conversation(), Some(&id));
        assert_eq!(engine.connection_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_send_user_message_confirms_and_sends_frame() {
        let (mut engine, mut events, mut peer) = connected(EngineConfig::default()).await;
        let placeholder = engine.create_conversation();

        let message_id = engine
            .send_user_message(&placeholder, "hello there")
            .await
            .unwrap();

        let canonical = ConversationId::from("conv-1");
        assert!(engine.conversation(&placeholder).is_none());
        assert_eq!(engine.conversation(&canonical).unwrap().messages.len(), 1);
        assert_eq!(engine.active_conversation(), Some(&canonical));
        assert_eq!(
            drain(&mut events),
            vec![EngineEvent::ConversationConfirmed {
                placeholder,
                canonical: canonical.clone(),
            }]
        );

        let frame = peer.recv().await.unwrap();
        let PeerFrame::Text(text) = frame else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["conversation_id"], "conv-1");
        assert_eq!(value["message_id"], message_id.0.as_str());
    }

    #[tokio::test]
    async fn test_send_without_connection_keeps_message() {
        let (mut engine, _events, _server) = engine(EngineConfig::default());
        let id = engine.create_conversation();
        let result = engine.send_user_message(&id, "offline").await;
        assert!(matches!(result, Err(EngineError::Transport(TransportError::NotConnected))));

        let canonical = ConversationId::from("conv-1");
        assert_eq!(engine.conversation(&canonical).unwrap().messages[0].content, "offline");
    }

    #[tokio::test]
    async fn test_unbatched_stream_appends_each_token() {
        let mut config = EngineConfig::default();
        config.batching = config.batching.unbatched();
        let (mut engine, mut events, peer) = connected(config).await;
        let conversation = engine.create_conversation();
        engine.send_user_message(&conversation, "hi").await.unwrap();
        drain(&mut events);

        peer.send_json(&json!({"type": "session_start", "session_id": "s1"}));
        peer.send_json(&json!({"type": "token", "session_id": "s1", "token": "Hel"}));
        peer.send_json(&json!({"type": "token", "session_id": "s1", "token": "lo"}));
        for _ in 0..3 {
            assert!(engine.step().await);
        }

        let canonical = ConversationId::from("conv-1");
        let stream_message = MessageId::for_stream(&SessionId::from("s1"));
        let appended: Vec<String> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::StreamChunkAppended { text, .. } => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(appended, vec!["Hel".to_string(), "lo".to_string()]);

        let conversation = engine.conversation(&canonical).unwrap();
        let answer = conversation
            .messages
            .iter()
            .find(|m| m.id == stream_message)
            .unwrap();
        assert_eq!(answer.content, "Hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_flushes_partial_batch() {
        let (mut engine, mut events, peer) = connected(EngineConfig::default()).await;
        let conversation = engine.create_conversation();
        engine.send_user_message(&conversation, "hi").await.unwrap();
        drain(&mut events);

        peer.send_json(&json!({"type": "session_start", "session_id": "s1"}));
        peer.send_json(&json!({"type": "stream_chunk", "session_id": "s1", "content": "a"}));
        peer.send_json(&json!({"type": "stream_chunk", "session_id": "s1", "content": "b"}));
        peer.send_json(&json!({"type": "complete", "session_id": "s1"}));

        let mut completed = None;
        let mut text = String::new();
        while completed.is_none() {
            assert!(engine.step().await);
            for event in drain(&mut events) {
                match event {
                    EngineEvent::StreamChunkAppended { text: chunk, .. } => text.push_str(&chunk),
                    EngineEvent::StreamCompleted {
                        conversation_id,
                        metrics,
                        ..
                    } => completed = Some((conversation_id, metrics)),
                    _ => {}
                }
            }
        }

        let (conversation_id, metrics) = completed.unwrap();
        assert_eq!(text, "ab");
        assert_eq!(conversation_id, ConversationId::from("conv-1"));
        assert_eq!(metrics.update_count, 2);
        assert!(!engine.sessions().session(&SessionId::from("s1")).unwrap().is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_ticks_deliver_full_batches() {
        let (mut engine, mut events, peer) = connected(EngineConfig::default()).await;
        let conversation = engine.create_conversation();
        engine.send_user_message(&conversation, "hi").await.unwrap();
        drain(&mut events);

        for token in ["Hello", " ", "world", "!", " This", " is", " a", " test"] {
            peer.send_json(&json!({"type": "token", "session_id": "s1", "token": token}));
        }

        let mut batches = Vec::new();
        while batches.len() < 3 {
            assert!(engine.step().await);
            for event in drain(&mut events) {
                if let EngineEvent::StreamChunkAppended {
                    text, token_count, ..
                } = event
                {
                    batches.push((text, token_count));
                }
            }
        }

        assert_eq!(
            batches.iter().map(|(_, n)| *n).collect::<Vec<_>>(),
            vec![3, 3, 2]
        );
        let text: String = batches.into_iter().map(|(t, _)| t).collect();
        assert_eq!(text, "Hello world! This is a test");
        assert_eq!(engine.stream_stats().tokens_processed, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_title_push_and_error_frames() {
        let (mut engine, mut events, peer) = connected(EngineConfig::default()).await;
        let conversation = engine.create_conversation();
        engine
            .send_user_message(&conversation, "tell me about tokio")
            .await
            .unwrap();
        drain(&mut events);

        peer.send_json(&json!({
            "type": "title_updated",
            "conversation_id": "conv-1",
            "title": "Tokio basics",
        }));
        peer.send_json(&json!({"type": "error", "message": "overloaded"}));

        // The pushed title resolves the open subscription and comes back
        // as a title result on a later step
        let mut seen = Vec::new();
        while seen.len() < 2 {
            assert!(engine.step().await);
            seen.extend(drain(&mut events));
        }
        assert!(seen.contains(&EngineEvent::TitleUpdated {
            conversation_id: ConversationId::from("conv-1"),
            title: "Tokio basics".to_string(),
        }));
        assert!(seen.contains(&EngineEvent::ServerError {
            error: "overloaded".to_string(),
        }));
        assert_eq!(
            engine.conversation(&ConversationId::from("conv-1")).unwrap().title,
            "Tokio basics"
        );
    }

    #[tokio::test]
    async fn test_delete_drops_sessions() {
        let (mut engine, mut events, peer) = connected(EngineConfig::default()).await;
        let conversation = engine.create_conversation();
        engine.send_user_message(&conversation, "hi").await.unwrap();
        peer.send_json(&json!({"type": "session_start", "session_id": "s1"}));
        assert!(engine.step().await);
        assert_eq!(engine.sessions().len(), 1);
        drain(&mut events);

        let canonical = ConversationId::from("conv-1");
        assert_eq!(engine.delete_conversation(&canonical).await, None);
        assert!(engine.sessions().is_empty());
        assert_eq!(
            drain(&mut events),
            vec![EngineEvent::ConversationDeleted {
                conversation_id: canonical,
                active: None,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reconnect_is_reported() {
        let mut config = EngineConfig::default();
        config.connection = config
            .connection
            .with_reconnect_base_delay(Duration::from_millis(10))
            .with_max_reconnect_attempts(1);
        let (connector, mut server) = MemoryConnector::new();
        let (mut engine, mut events) =
            Engine::new(connector.clone(), InMemoryBackend::new(), config);
        engine.connect().await.unwrap();
        connector.script(ConnectPlan::Refuse("down".into()));
        drop(server.accept().await);

        let mut lost = None;
        while lost.is_none() {
            assert!(engine.step().await);
            for event in drain(&mut events) {
                if let EngineEvent::ConnectionLost { error } = event {
                    lost = Some(error);
                }
            }
        }
        assert!(lost.unwrap().contains("gave up reconnecting"));
        assert_eq!(engine.connection_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecoverable_stream_fetches_once_and_fails() {
        let (mut engine, mut events, peer) = connected(EngineConfig::default()).await;

        peer.send_json(&json!({"type": "session_start", "session_id": "s1", "conversation_id": "gone-1"}));
        for token in ["a", "b", "c", "d", "e", "f", "g", "h", "i"] {
            peer.send_json(&json!({"type": "token", "session_id": "s1", "token": token}));
        }
        peer.send_json(&json!({"type": "complete", "session_id": "s1"}));
        peer.send_json(&json!({"type": "typing", "active": false}));

        let mut seen = Vec::new();
        while !seen.iter().any(|e| matches!(e, EngineEvent::Typing { .. })) {
            assert!(engine.step().await);
            seen.extend(drain(&mut events));
        }

        let fetches = engine
            .backend()
            .calls()
            .into_iter()
            .filter(|c| matches!(c, BackendCall::FetchHistory(_)))
            .count();
        assert_eq!(fetches, 1);

        let failed: Vec<&EngineEvent> = seen
            .iter()
            .filter(|e| matches!(e, EngineEvent::StreamFailed { .. }))
            .collect();
        assert_eq!(failed.len(), 1);
        assert!(matches!(
            failed[0],
            EngineEvent::StreamFailed { conversation_id, .. } if conversation_id == &ConversationId::from("gone-1")
        ));
        assert!(!seen.iter().any(|e| matches!(
            e,
            EngineEvent::StreamChunkAppended { .. } | EngineEvent::StreamCompleted { .. }
        )));
        assert!(engine.sessions().session(&SessionId::from("s1")).unwrap().failed);
    }

    #[tokio::test]
    async fn test_duplicate_message_is_not_sent_twice() {
        let (mut engine, _events, mut peer) = connected(EngineConfig::default()).await;
        let conversation = engine.create_conversation();

        engine.send_user_message(&conversation, "yes").await.unwrap();
        let canonical = ConversationId::from("conv-1");
        let second = engine.send_user_message(&canonical, "yes").await;
        assert!(matches!(second, Err(EngineError::DuplicateMessage(id)) if id == canonical));

        assert!(matches!(peer.recv().await, Some(PeerFrame::Text(_))));
        assert_eq!(engine.conversation(&canonical).unwrap().messages.len(), 1);

        // Only the first message reached the socket
        engine.disconnect().await;
        assert!(matches!(peer.recv().await, Some(PeerFrame::Close { .. })));
    }
}
