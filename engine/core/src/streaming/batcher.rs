//! Token Batching Pacer
//!
//! Groups answer tokens into batches per stream and paces delivery so
//! consumers see at most one batch per frame tick.
//!
//! # Flow
//!
//! ```text
//! process(stream, token)
//!      │
//!      ├─ unbatched ─────────────────────────────► sink (or processing queue)
//!      │
//!      ▼
//!  per-stream queue ──full──► processing queue ──tick()──► sink (one per tick)
//!      │                            ▲
//!      └── max-wait deadline ───────┘ (expired in tick())
//!
//! flush(stream) ──► that stream's queued batches, then its partial batch
//! ```
//!
//! `process`, `tick` and `flush` take `now` from the caller so pacing stays
//! deterministic under test.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::messages::SessionId;

// ============================================================================
// Configuration
// ============================================================================

/// Batching policy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Whether tokens are grouped at all
    pub enabled: bool,

    /// Tokens per batch (values ≤ 1 disable grouping)
    pub batch_size: usize,

    /// Longest a partial batch may wait before it is emitted anyway
    pub max_wait_ms: u64,

    /// Drain period of the processing queue
    ///
    /// Default 16ms (~60 updates per second).
    pub frame_interval_ms: u64,

    /// Route one-token batches through the processing queue too
    pub pace_unbatched: bool,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 3,
            max_wait_ms: 100,
            frame_interval_ms: 16,
            pace_unbatched: false,
        }
    }
}

impl BatchingConfig {
    /// Set the batch size
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Disable grouping
    #[must_use]
    pub fn unbatched(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Max-wait ceiling as a `Duration`
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Frame period as a `Duration`
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }

    /// Whether tokens are actually grouped
    #[must_use]
    pub fn groups_tokens(&self) -> bool {
        self.enabled && self.batch_size > 1
    }
}

// ============================================================================
// Batches and Sinks
// ============================================================================

/// A contiguous run of one stream's tokens
///
/// Built once by the batcher and handed to exactly one sink call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenBatch {
    stream_id: SessionId,
    tokens: Vec<String>,
    timestamp: Instant,
}

impl TokenBatch {
    fn new(stream_id: SessionId, tokens: Vec<String>, timestamp: Instant) -> Self {
        Self {
            stream_id,
            tokens,
            timestamp,
        }
    }

    /// Stream the tokens belong to
    #[must_use]
    pub fn stream_id(&self) -> &SessionId {
        &self.stream_id
    }

    /// Tokens in arrival order
    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Number of tokens
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the batch holds no tokens
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// When the batch was formed
    #[must_use]
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Concatenated text
    #[must_use]
    pub fn text(&self) -> String {
        self.tokens.concat()
    }

    /// Take the tokens
    #[must_use]
    pub fn into_tokens(self) -> Vec<String> {
        self.tokens
    }
}

/// Receiver of emitted batches
pub trait BatchSink {
    /// Take ownership of one batch
    fn deliver(&mut self, batch: TokenBatch);
}

impl<F: FnMut(TokenBatch)> BatchSink for F {
    fn deliver(&mut self, batch: TokenBatch) {
        self(batch);
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Observational counters
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PerformanceStats {
    /// Tokens accepted by `process`
    pub tokens_processed: u64,
    /// Batches handed to a sink
    pub batches_processed: u64,
    /// Mean tokens per delivered batch
    pub average_batch_size: f64,
    /// Mean time between batch formation and delivery
    pub average_processing_time: Duration,
    /// Deepest the processing queue has been
    pub peak_queue_size: usize,
    total_batched_tokens: u64,
    total_processing_time: Duration,
}

impl PerformanceStats {
    #[allow(clippy::cast_precision_loss)]
    fn record_delivery(&mut self, batch: &TokenBatch, now: Instant) {
        self.batches_processed += 1;
        self.total_batched_tokens += batch.len() as u64;
        self.total_processing_time += now.saturating_duration_since(batch.timestamp);
        self.average_batch_size = self.total_batched_tokens as f64 / self.batches_processed as f64;
        let batches = u32::try_from(self.batches_processed).unwrap_or(u32::MAX);
        self.average_processing_time = self.total_processing_time / batches;
    }
}

// ============================================================================
// Batcher
// ============================================================================

#[derive(Debug, Default)]
struct StreamQueue {
    tokens: VecDeque<String>,
    deadline: Option<Instant>,
}

/// Per-stream token queues feeding one paced processing queue
#[derive(Debug)]
pub struct TokenBatcher {
    config: BatchingConfig,
    streams: HashMap<SessionId, StreamQueue>,
    processing: VecDeque<TokenBatch>,
    stats: PerformanceStats,
}

impl TokenBatcher {
    /// Create a batcher with the given policy
    #[must_use]
    pub fn new(config: BatchingConfig) -> Self {
        Self {
            config,
            streams: HashMap::new(),
            processing: VecDeque::new(),
            stats: PerformanceStats::default(),
        }
    }

    /// The policy in use
    #[must_use]
    pub fn config(&self) -> &BatchingConfig {
        &self.config
    }

    /// Accept one token for `stream_id`
    pub fn process(
        &mut self,
        stream_id: &SessionId,
        token: impl Into<String>,
        now: Instant,
        sink: &mut impl BatchSink,
    ) {
        let token = token.into();
        self.stats.tokens_processed += 1;

        if !self.config.groups_tokens() {
            let batch = TokenBatch::new(stream_id.clone(), vec![token], now);
            if self.config.pace_unbatched {
                self.enqueue(batch);
            } else {
                self.emit(batch, now, sink);
            }
            return;
        }

        let size = self.config.batch_size;
        let max_wait = self.config.max_wait();
        let queue = self.streams.entry(stream_id.clone()).or_default();
        queue.tokens.push_back(token);

        if queue.tokens.len() >= size {
            let tokens: Vec<String> = queue.tokens.drain(..size).collect();
            if queue.tokens.is_empty() {
                queue.deadline = None;
            }
            tracing::trace!(stream_id = %stream_id, size, "Batch full");
            self.enqueue(TokenBatch::new(stream_id.clone(), tokens, now));
        } else if queue.deadline.is_none() {
            queue.deadline = Some(now + max_wait);
        }
    }

    /// Advance the pacer by one frame
    ///
    /// Partial batches whose max-wait has passed move to the processing
    /// queue, then at most one batch is delivered. Returns whether a batch
    /// was delivered.
    pub fn tick(&mut self, now: Instant, sink: &mut impl BatchSink) -> bool {
        self.expire(now);
        match self.processing.pop_front() {
            Some(batch) => {
                self.emit(batch, now, sink);
                true
            }
            None => false,
        }
    }

    /// Drain everything buffered for `stream_id` right away
    ///
    /// Batches of this stream still waiting in the processing queue go first
    /// so arrival order survives. Cancels the stream's max-wait deadline.
    /// Returns the number of batches delivered.
    pub fn flush(
        &mut self,
        stream_id: &SessionId,
        now: Instant,
        sink: &mut impl BatchSink,
    ) -> usize {
        let mut delivered = 0;

        let (mine, others): (VecDeque<_>, VecDeque<_>) = self
            .processing
            .drain(..)
            .partition(|batch| &batch.stream_id == stream_id);
        self.processing = others;
        for batch in mine {
            self.emit(batch, now, sink);
            delivered += 1;
        }

        if let Some(queue) = self.streams.remove(stream_id) {
            if !queue.tokens.is_empty() {
                let batch = TokenBatch::new(stream_id.clone(), queue.tokens.into(), now);
                self.emit(batch, now, sink);
                delivered += 1;
            }
        }

        if delivered > 0 {
            tracing::debug!(stream_id = %stream_id, batches = delivered, "Stream flushed");
        }
        delivered
    }

    /// Earliest pending max-wait deadline
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.streams.values().filter_map(|q| q.deadline).min()
    }

    /// Whether anything is waiting to be delivered
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.processing.is_empty() || self.streams.values().any(|q| !q.tokens.is_empty())
    }

    /// Tokens waiting in a stream's partial batch
    #[must_use]
    pub fn queued_tokens(&self, stream_id: &SessionId) -> usize {
        self.streams.get(stream_id).map_or(0, |q| q.tokens.len())
    }

    /// Batches waiting for a frame tick
    #[must_use]
    pub fn pending_batches(&self) -> usize {
        self.processing.len()
    }

    /// Counters so far
    #[must_use]
    pub fn stats(&self) -> &PerformanceStats {
        &self.stats
    }

    fn expire(&mut self, now: Instant) {
        let mut expired: Vec<(Instant, SessionId)> = self
            .streams
            .iter()
            .filter_map(|(id, q)| q.deadline.filter(|d| *d <= now).map(|d| (d, id.clone())))
            .collect();
        expired.sort();

        for (_, stream_id) in expired {
            let Some(queue) = self.streams.get_mut(&stream_id) else {
                continue;
            };
            queue.deadline = None;
            let tokens: Vec<String> = queue.tokens.drain(..).collect();
            if !tokens.is_empty() {
                tracing::trace!(stream_id = %stream_id, size = tokens.len(), "Max wait elapsed");
                self.enqueue(TokenBatch::new(stream_id, tokens, now));
            }
        }
    }

    fn enqueue(&mut self, batch: TokenBatch) {
        self.processing.push_back(batch);
        self.stats.peak_queue_size = self.stats.peak_queue_size.max(self.processing.len());
    }

    fn emit(&mut self, batch: TokenBatch, now: Instant, sink: &mut impl BatchSink) {
        self.stats.record_delivery(&batch, now);
        sink.deliver(batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TOKENS: [&str; 8] = ["Hello", " ", "world", "!", " This", " is", " a", " test"];

    fn stream() -> SessionId {
        SessionId::from("s1")
    }

    fn drain(batcher: &mut TokenBatcher, now: Instant) -> Vec<TokenBatch> {
        let mut out = Vec::new();
        while batcher.tick(now, &mut |b: TokenBatch| out.push(b)) {}
        out
    }

    #[test]
    fn test_batches_of_three() {
        let mut batcher = TokenBatcher::new(BatchingConfig::default().with_batch_size(3));
        let start = Instant::now();
        let mut direct = Vec::new();
        for token in TOKENS {
            batcher.process(&stream(), token, start, &mut |b: TokenBatch| direct.push(b));
        }
        assert!(direct.is_empty());

        let batches = drain(&mut batcher, start + Duration::from_millis(100));
        let sizes: Vec<usize> = batches.iter().map(TokenBatch::len).collect();
        assert_eq!(sizes, vec![3, 3, 2]);

        let text: String = batches.iter().map(TokenBatch::text).collect();
        assert_eq!(text, TOKENS.concat());
    }

    #[test]
    fn test_one_batch_per_tick() {
        let mut batcher = TokenBatcher::new(BatchingConfig::default().with_batch_size(2));
        let now = Instant::now();
        for token in ["a", "b", "c", "d"] {
            batcher.process(&stream(), token, now, &mut |_: TokenBatch| {});
        }
        assert_eq!(batcher.pending_batches(), 2);

        let mut out = Vec::new();
        assert!(batcher.tick(now, &mut |b: TokenBatch| out.push(b)));
        assert_eq!(out.len(), 1);
        assert_eq!(batcher.pending_batches(), 1);
    }

    #[test]
    fn test_partial_batch_waits_for_deadline() {
        let mut batcher = TokenBatcher::new(BatchingConfig::default().with_batch_size(3));
        let start = Instant::now();
        batcher.process(&stream(), "a", start, &mut |_: TokenBatch| {});
        batcher.process(&stream(), "b", start + Duration::from_millis(50), &mut |_: TokenBatch| {});

        // Deadline was set by the first token and is not extended
        assert_eq!(batcher.next_deadline(), Some(start + Duration::from_millis(100)));
        assert!(drain(&mut batcher, start + Duration::from_millis(99)).is_empty());

        let batches = drain(&mut batcher, start + Duration::from_millis(100));
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].tokens(), ["a".to_string(), "b".to_string()]);
        assert_eq!(batcher.next_deadline(), None);
    }

    #[test]
    fn test_flush_partial() {
        let mut batcher = TokenBatcher::new(BatchingConfig::default().with_batch_size(3));
        let now = Instant::now();
        batcher.process(&stream(), "a", now, &mut |_: TokenBatch| {});
        batcher.process(&stream(), "b", now, &mut |_: TokenBatch| {});

        let mut out = Vec::new();
        assert_eq!(batcher.flush(&stream(), now, &mut |b: TokenBatch| out.push(b)), 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 2);
        assert_eq!(batcher.queued_tokens(&stream()), 0);
        assert_eq!(batcher.next_deadline(), None);
        assert!(!batcher.has_pending());
    }

    #[test]
    fn test_flush_stats_use_caller_clock() {
        let mut batcher = TokenBatcher::new(BatchingConfig::default().with_batch_size(3));
        let start = Instant::now();
        batcher.process(&stream(), "a", start, &mut |_: TokenBatch| {});
        batcher.process(&stream(), "b", start, &mut |_: TokenBatch| {});

        let later = start + Duration::from_millis(40);
        batcher.flush(&stream(), later, &mut |_: TokenBatch| {});
        assert_eq!(batcher.stats().batches_processed, 1);
        assert_eq!(batcher.stats().average_processing_time, Duration::from_millis(40));
    }

    #[test]
    fn test_flush_preserves_order_ahead_of_pacer() {
        let mut batcher = TokenBatcher::new(BatchingConfig::default().with_batch_size(3));
        let other = SessionId::from("s2");
        let now = Instant::now();
        for token in TOKENS {
            batcher.process(&stream(), token, now, &mut |_: TokenBatch| {});
        }
        for token in ["x", "y", "z"] {
            batcher.process(&other, token, now, &mut |_: TokenBatch| {});
        }

        let mut out = Vec::new();
        batcher.flush(&stream(), now, &mut |b: TokenBatch| out.push(b));
        let text: String = out.iter().map(TokenBatch::text).collect();
        assert_eq!(text, TOKENS.concat());

        // The other stream's batch is untouched
        let rest = drain(&mut batcher, now);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].stream_id(), &other);
    }

    #[test]
    fn test_streams_are_independent() {
        let mut batcher = TokenBatcher::new(BatchingConfig::default().with_batch_size(2));
        let a = SessionId::from("a");
        let b = SessionId::from("b");
        let now = Instant::now();
        for (i, token) in ["a1", "b1", "a2", "b2", "a3"].iter().enumerate() {
            let id = if i % 2 == 0 { &a } else { &b };
            batcher.process(id, *token, now, &mut |_: TokenBatch| {});
        }
        let batches = drain(&mut batcher, now + Duration::from_secs(1));
        let a_text: String = batches.iter().filter(|x| x.stream_id() == &a).map(TokenBatch::text).collect();
        let b_text: String = batches.iter().filter(|x| x.stream_id() == &b).map(TokenBatch::text).collect();
        assert_eq!(a_text, "a1a2a3");
        assert_eq!(b_text, "b1b2");
    }

    #[test]
    fn test_unbatched_emits_immediately() {
        let mut batcher = TokenBatcher::new(BatchingConfig::default().unbatched());
        let mut out = Vec::new();
        batcher.process(&stream(), "hi", Instant::now(), &mut |b: TokenBatch| out.push(b));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 1);

        let mut batcher = TokenBatcher::new(BatchingConfig::default().with_batch_size(1));
        let mut out = Vec::new();
        batcher.process(&stream(), "hi", Instant::now(), &mut |b: TokenBatch| out.push(b));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_paced_unbatched_goes_through_queue() {
        let config = BatchingConfig {
            pace_unbatched: true,
            ..BatchingConfig::default().unbatched()
        };
        let mut batcher = TokenBatcher::new(config);
        let now = Instant::now();
        let mut out = Vec::new();
        batcher.process(&stream(), "a", now, &mut |b: TokenBatch| out.push(b));
        batcher.process(&stream(), "b", now, &mut |b: TokenBatch| out.push(b));
        assert!(out.is_empty());
        assert_eq!(drain(&mut batcher, now).len(), 2);
    }

    #[test]
    fn test_stats() {
        let mut batcher = TokenBatcher::new(BatchingConfig::default().with_batch_size(2));
        let now = Instant::now();
        for token in ["a", "b", "c", "d"] {
            batcher.process(&stream(), token, now, &mut |_: TokenBatch| {});
        }
        drain(&mut batcher, now);
        let stats = batcher.stats();
        assert_eq!(stats.tokens_processed, 4);
        assert_eq!(stats.batches_processed, 2);
        assert!((stats.average_batch_size - 2.0).abs() < f64::EPSILON);
        assert_eq!(stats.peak_queue_size, 2);
    }
}
