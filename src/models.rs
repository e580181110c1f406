//! Core data models used throughout chatsync.
//!
//! These types represent the message events, chunks, and index documents that
//! flow through the ingestion and synchronization pipeline.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A message lifecycle event produced by a source adapter.
///
/// Identity is `(conversation_id, message_id)`; `edit_revision` disambiguates
/// versions of the same message and is monotonic per message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub conversation_id: String,
    pub message_id: i64,
    /// Monotonic per message. 0 for the original version; edits bump it.
    #[serde(default)]
    pub edit_revision: i64,
    /// Epoch seconds of the message (or of the edit, for edit events).
    pub timestamp: i64,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub raw_text: String,
    #[serde(default)]
    pub reply_to_id: Option<i64>,
    #[serde(default)]
    pub thread_id: Option<i64>,
    #[serde(default)]
    pub deleted: bool,
}

/// A derived retrieval unit: one token-bounded segment of a message.
///
/// `(conversation_id, message_id, chunk_index, chunking_version)` is the
/// stable document identity; re-running the pipeline on unchanged input
/// yields byte-identical chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub conversation_id: String,
    pub message_id: i64,
    pub chunk_index: i64,
    pub chunking_version: u32,
    pub text: String,
    pub token_count: usize,
    pub has_link: bool,
    pub thread_id: Option<i64>,
    /// Content hash keying the embedding cache.
    pub text_hash: String,
}

impl Chunk {
    /// Deterministic index document id for this chunk.
    pub fn doc_id(&self) -> String {
        format!(
            "{}:{}:{}:v{}",
            self.conversation_id, self.message_id, self.chunk_index, self.chunking_version
        )
    }
}

/// Externally visible unit fed to the search index.
#[derive(Debug, Clone)]
pub struct IndexDocument {
    pub id: String,
    pub conversation_id: String,
    pub message_id: i64,
    pub chunk_index: i64,
    pub sender: Option<String>,
    pub message_date: i64,
    pub thread_id: Option<i64>,
    pub has_link: bool,
    pub text: String,
    pub vector: Vec<f32>,
}

/// Per-conversation sync state: the authority for resumption.
#[derive(Debug, Clone)]
pub struct SyncState {
    pub conversation_id: String,
    pub last_message_id: Option<i64>,
    pub last_swept_at: Option<i64>,
    pub chunking_version: u32,
    pub preprocess_version: u32,
}

/// A chunk row recorded locally after it was fed to the index.
///
/// The mirror is what makes shrink detection, revision checks, and purge
/// possible without querying the remote index.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub conversation_id: String,
    pub message_id: i64,
    pub chunk_index: i64,
    pub edit_revision: i64,
    pub text_hash: String,
    pub message_date: i64,
    pub deleted_at: Option<i64>,
    pub sender: Option<String>,
    pub thread_id: Option<i64>,
    pub has_link: bool,
}

/// Runtime counters shared across conversation workers.
#[derive(Debug, Default)]
pub struct Metrics {
    pub messages_scanned: AtomicU64,
    pub messages_indexed: AtomicU64,
    pub messages_skipped: AtomicU64,
    pub messages_failed: AtomicU64,
    pub chunks_written: AtomicU64,
    pub embed_calls: AtomicU64,
    pub embed_cache_hits: AtomicU64,
    pub embed_cache_misses: AtomicU64,
    pub feed_success: AtomicU64,
    pub feed_retries: AtomicU64,
    pub feed_failures: AtomicU64,
    pub deletes_issued: AtomicU64,
    pub total_tokens: AtomicU64,
    /// Accumulated cost estimate in micro-dollars (USD * 1e6).
    pub cost_micro_usd: AtomicU64,
}

impl Metrics {
    pub fn add_cost(&self, usd: f64) {
        self.cost_micro_usd
            .fetch_add((usd * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    pub fn cost_usd(&self) -> f64 {
        self.cost_micro_usd.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.embed_cache_hits.load(Ordering::Relaxed);
        let misses = self.embed_cache_misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            return 0.0;
        }
        hits as f64 / (hits + misses) as f64 * 100.0
    }
}
