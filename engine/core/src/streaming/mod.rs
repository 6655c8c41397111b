//! Streaming
//!
//! Token batching and frame-paced delivery of answer text.

pub mod batcher;

pub use batcher::{BatchSink, BatchingConfig, PerformanceStats, TokenBatch, TokenBatcher};
